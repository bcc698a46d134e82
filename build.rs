use std::io::Result;
fn main() -> Result<()> {
    // Proto compilation rules for the wire envelope
    let mut config = prost_build::Config::new();
    config.bytes([
        "Envelope.payload",
        "Envelope.signature",
        "Envelope.cert_signature",
        "ConnEstablish.pki_id",
        "ConnEstablish.identity",
        "ConnEstablish.tls_cert_hash",
        "Message.gossip",
    ]);
    config.compile_protos(&["src/wire.proto"], &["src/"])?;
    Ok(())
}
