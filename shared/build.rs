//! Compiles the wire protocol shared between the daemon and its RPC clients.
//!
//! Mirrors the teacher's `prost_build` pipeline: one `.proto` per concern
//! (descriptor values, callbacks, requests, the RPC service itself), compiled
//! in a single pass so cross-file imports resolve. Unlike the teacher we
//! leave the generated code in `OUT_DIR` and pull it in via `include!` from
//! `src/proto/mod.rs` rather than copying it into the source tree — there is
//! no DLL/driver boundary here that needs the generated types committed.

use prost_build::Config;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::new();
    config.btree_map(["."]);

    tonic_build::configure().compile_with_config(
        config,
        &[
            "src/proto/descriptor.proto",
            "src/proto/callback.proto",
            "src/proto/request.proto",
            "src/proto/rpc.proto",
        ],
        &["src/proto"],
    )?;

    Ok(())
}
