use thiserror::Error;

/// 传输错误分类：决定重试（Transient）还是放弃（Fatal）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 网络不可达、broker 拒绝连接、连接/通道已关闭等，可重试
    Transient,
    /// 协议错误、拓扑不存在、权限不足等，重试无意义
    Fatal,
}

/// 传输层统一错误
#[derive(Debug, Clone, Error)]
#[error("{class:?} transport error: {reason}")]
pub struct TransportError {
    class: ErrorClass,
    reason: String,
}

pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    pub fn new(class: ErrorClass, reason: impl Into<String>) -> Self {
        Self {
            class,
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, reason)
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::new(ErrorClass::Fatal, reason)
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}
