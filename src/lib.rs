//! Workspace root package. Anchors shared tooling (git hooks via
//! `cargo-husky`); all functionality lives in the `crates/` members.
