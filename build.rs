use std::env;
use std::fs;
use std::path::Path;

fn main() {
    // 获取项目根目录
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();

    // 确保data目录存在
    let data_dir = Path::new(&manifest_dir).join("data");
    if !data_dir.exists() {
        fs::create_dir_all(&data_dir).expect("Failed to create data directory");
    }

    // 默认数据库路径，运行时可用 DB_PATH 覆盖
    let db_file = data_dir.join("crypto.db");
    println!("cargo:rustc-env=DATAHUB_DEFAULT_DB_PATH={}", db_file.display());
    println!("cargo:rustc-env=DATAHUB_DEFAULT_DATA_DIR={}", data_dir.display());

    if !db_file.exists() {
        println!("cargo:warning=crypto.db not found. Run 'cargo run -- run' to build the price table.");
    }
    println!("cargo:rerun-if-changed=build.rs");
}
