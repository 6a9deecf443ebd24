use std::io::ErrorKind;
use std::path::Path;
use std::{fs, io};
use tonic_build;

const CONSENSUS_PROTO: &str = "./protos/consensus.proto";

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed={}", CONSENSUS_PROTO);
    build_proto()?;
    Ok(())
}

fn build_proto() -> io::Result<()> {
    idempotent_create_dir("./generated/")?;
    // Segment headers, footers and entry batches share these messages with the replication RPCs.
    tonic_build::configure()
        .build_server(true)
        .out_dir("./generated/")
        .compile(&[CONSENSUS_PROTO], &["./protos/"])
}

fn idempotent_create_dir<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match fs::create_dir(path) {
        Ok(_) => Ok(()),
        Err(e) => match e.kind() {
            ErrorKind::AlreadyExists => Ok(()),
            _ => Err(e),
        },
    }
}
