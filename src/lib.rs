// 公开导出的模块，供外部使用
pub mod models;
pub mod store;
pub mod errors;
pub mod scrapers;
pub mod services;
pub mod config;
pub mod util;

// 重新导出常用类型，方便使用
pub use models::price::{DownloadJob, MarketCapSample, PriceBar, Symbol};
pub use store::PriceStore;
pub use config::Config;
pub use services::pipeline::{PipelineOrchestrator, PipelineReport, Stage};
pub use errors::{Result, DataHubError};
