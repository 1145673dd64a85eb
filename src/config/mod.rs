pub mod app;

pub use app::AppConfig;
pub use app::Environment;
pub use app::ServerConfig;
pub use app::CacheConfig;
pub use app::BalancerConfig;
pub use app::VariantConfig;
pub use app::NodeConfig;
