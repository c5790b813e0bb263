use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    hugepage_size: Option<usize>,
    eden_hugepages: Option<usize>,
    peak_demand_nbuckets: Option<usize>,
    hpa_min_var_vec_size: Option<usize>,
    process_madvise_max_batch_limit: Option<usize>,
    hpa_purge_batch_max: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    page_size: usize,
    page_shift: u32,
    hugepage_size: usize,
    hugepage_shift: u32,
    eden_hugepages: usize,
    peak_demand_nbuckets: usize,
    hpa_min_var_vec_size: usize,
    process_madvise_max_batch_limit: usize,
    hpa_purge_batch_max: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let page_size = cfg.page_size.unwrap_or(8192);
    assert!(
        page_size > 0 && page_size.is_power_of_two(),
        "page_size ({}) must be a power of 2",
        page_size
    );

    let hugepage_size = cfg.hugepage_size.unwrap_or(2 * 1024 * 1024);
    assert!(
        hugepage_size > 0 && hugepage_size.is_power_of_two(),
        "hugepage_size ({}) must be a power of 2",
        hugepage_size
    );
    assert!(
        hugepage_size % page_size == 0,
        "hugepage_size ({}) must be a multiple of page_size ({})",
        hugepage_size,
        page_size
    );

    let eden_hugepages = cfg.eden_hugepages.unwrap_or(128);
    assert!(eden_hugepages > 0, "eden_hugepages must be > 0");

    let peak_demand_nbuckets = cfg.peak_demand_nbuckets.unwrap_or(32);
    assert!(
        peak_demand_nbuckets > 0,
        "peak_demand_nbuckets must be > 0"
    );

    let hpa_min_var_vec_size = cfg.hpa_min_var_vec_size.unwrap_or(8);
    assert!(hpa_min_var_vec_size > 0, "hpa_min_var_vec_size must be > 0");

    let process_madvise_max_batch_limit = cfg.process_madvise_max_batch_limit.unwrap_or(64);
    assert!(
        process_madvise_max_batch_limit >= hpa_min_var_vec_size,
        "process_madvise_max_batch_limit ({}) must be >= hpa_min_var_vec_size ({})",
        process_madvise_max_batch_limit,
        hpa_min_var_vec_size
    );

    let hpa_purge_batch_max = cfg.hpa_purge_batch_max.unwrap_or(16);
    assert!(hpa_purge_batch_max > 0, "hpa_purge_batch_max must be > 0");

    ResolvedConfig {
        page_size,
        page_shift: page_size.trailing_zeros(),
        hugepage_size,
        hugepage_shift: hugepage_size.trailing_zeros(),
        eden_hugepages,
        peak_demand_nbuckets,
        hpa_min_var_vec_size,
        process_madvise_max_batch_limit,
        hpa_purge_batch_max,
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/hpa_sec.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const HUGEPAGE_SHIFT: usize = {};\n\
         pub const HUGEPAGE: usize = {};\n\
         pub const EDEN_HUGEPAGES: usize = {};\n\
         pub const EDEN_SIZE: usize = HUGEPAGE * EDEN_HUGEPAGES;\n\
         pub const PEAK_DEMAND_NBUCKETS: usize = {};\n\
         pub const HPA_MIN_VAR_VEC_SIZE: usize = {};\n\
         pub const PROCESS_MADVISE_MAX_BATCH_LIMIT: usize = {};\n\
         pub const HPA_PURGE_BATCH_MAX: usize = {};\n",
        cfg.page_shift,
        cfg.page_size,
        cfg.hugepage_shift,
        cfg.hugepage_size,
        cfg.eden_hugepages,
        cfg.peak_demand_nbuckets,
        cfg.hpa_min_var_vec_size,
        cfg.process_madvise_max_batch_limit,
        cfg.hpa_purge_batch_max,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=HPA_SEC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("HPA_SEC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");
    let resolved = resolve_config(&config.config);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
