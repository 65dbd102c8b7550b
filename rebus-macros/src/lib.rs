use proc_macro::TokenStream;

mod derive_utils;
mod field_utils;
mod integration_event;

/// 集成事件宏
/// - 追加字段：`id: Uuid`, `occurred_at: DateTime<Utc>`（若缺失）并置于字段最前
/// - 合并派生 `Debug, Clone, Serialize, Deserialize`
/// - 自动实现 `::rebus_core::event::IntegrationEvent`
/// - 支持参数：`#[integration_event(name = "...")]`，默认使用结构体名作为事件类型名（路由键）
///
/// 使用方需要依赖 `uuid`、`chrono`（`serde` feature）与 `serde`。
#[proc_macro_attribute]
pub fn integration_event(attr: TokenStream, item: TokenStream) -> TokenStream {
    integration_event::expand(attr, item)
}
