use std::error::Error;
use cryptoscope_datahub::config::Config;
use cryptoscope_datahub::store::PriceStore;

fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env();

    let store = PriceStore::open(&config.db_path)?;
    store.ensure_schema()?;

    println!("Initialized price store at {} ({} rows)", config.db_path.display(), store.count_rows()?);
    Ok(())
}
