use std::error::Error;
use cryptoscope_datahub::config::Config;
use cryptoscope_datahub::store::PriceStore;
use cryptoscope_datahub::util::date_version;

fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env();

    // 检查数据库文件是否存在
    if !config.db_path.exists() {
        return Err(format!(
            "数据库不存在: {}，请先运行 'cargo run -- run'",
            config.db_path.display()
        ).into());
    }

    let store = PriceStore::open(&config.db_path)?;

    // 查找最新交易日期
    match store.latest_date()? {
        Some(date) => {
            println!("Latest trading date: {}", date);
            println!("Version: {}", date_version(date));
            Ok(())
        }
        None => Err("数据库中没有价格数据".into()),
    }
}
