// 导出所有模型组件

pub mod status;

// 重新导出核心类型
pub use status::{NodeStatus, Stats, Status, VariantStatus};
