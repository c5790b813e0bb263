//! Compile-time configuration, generated by `build.rs` from `hpa_sec.toml`
//! (or the file pointed to by the `HPA_SEC_CONFIG` env var).

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
