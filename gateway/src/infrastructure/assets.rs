// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! The four service contracts, embedded so the binary can export them.

use std::io;
use std::path::Path;

pub const PROTO_ASSETS: [(&str, &str); 4] = [
    (
        "tnc_routing.proto",
        include_str!("../../../proto/tnc_routing.proto"),
    ),
    (
        "tnc_communication.proto",
        include_str!("../../../proto/tnc_communication.proto"),
    ),
    (
        "tnc_lifecycle.proto",
        include_str!("../../../proto/tnc_lifecycle.proto"),
    ),
    (
        "tnc_consensus.proto",
        include_str!("../../../proto/tnc_consensus.proto"),
    ),
];

/// Writes the embedded `.proto` contracts into `dir`.
pub fn write_proto_assets(dir: &Path) -> io::Result<()> {
    for (name, contents) in PROTO_ASSETS {
        std::fs::write(dir.join(name), contents)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assets_are_written_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        write_proto_assets(dir.path()).unwrap();

        for (name, contents) in PROTO_ASSETS {
            let written = std::fs::read_to_string(dir.path().join(name)).unwrap();
            assert_eq!(written, contents);
            assert!(written.contains("syntax = \"proto3\";"));
        }
    }
}
