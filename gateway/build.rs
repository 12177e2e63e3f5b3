// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Compiles the four gateway service contracts with the vendored protoc.
//!
//! Generated code lands in `OUT_DIR` and is included via
//! `tonic::include_proto!` in `src/presentation/grpc/mod.rs`. The same
//! `.proto` files are embedded verbatim for the `--assets` export.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    let protos = [
        "../proto/tnc_routing.proto",
        "../proto/tnc_communication.proto",
        "../proto/tnc_lifecycle.proto",
        "../proto/tnc_consensus.proto",
    ];

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &protos,
            &[
                "../proto",
                protoc_bin_vendored::include_path()?
                    .to_str()
                    .expect("vendored include path is valid UTF-8"),
            ],
        )?;

    for proto in protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    Ok(())
}
