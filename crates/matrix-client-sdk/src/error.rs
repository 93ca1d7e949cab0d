use std::fmt;

/// 协议层错误码（homeserver 返回的 errcode）
///
/// 只枚举 SDK 需要区分处理的错误码，其余归入 `Unknown`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Forbidden,
    UnknownToken,
    BadJson,
    NotJson,
    NotFound,
    LimitExceeded,
    TooLarge,
    Unknown,
    /// 服务端返回了无法识别的 errcode 字符串
    Unrecognized,
}

impl ErrorCode {
    pub fn from_errcode(errcode: &str) -> Self {
        match errcode {
            "M_FORBIDDEN" => ErrorCode::Forbidden,
            "M_UNKNOWN_TOKEN" => ErrorCode::UnknownToken,
            "M_BAD_JSON" => ErrorCode::BadJson,
            "M_NOT_JSON" => ErrorCode::NotJson,
            "M_NOT_FOUND" => ErrorCode::NotFound,
            "M_LIMIT_EXCEEDED" => ErrorCode::LimitExceeded,
            "M_TOO_LARGE" => ErrorCode::TooLarge,
            // M_UNKNOWN 实际语义是服务端校验失败（内容被拒绝）
            "M_UNKNOWN" => ErrorCode::Unknown,
            _ => ErrorCode::Unrecognized,
        }
    }

    /// 该错误码是否表示内容被永久拒绝（不应重试）
    pub fn is_permanent_rejection(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unknown
                | ErrorCode::Forbidden
                | ErrorCode::BadJson
                | ErrorCode::NotJson
                | ErrorCode::TooLarge
        )
    }
}

#[derive(Debug)]
pub enum MatrixSdkError {
    /// 网络不可达 / 超时（可重试）
    Transport(String),
    /// 服务端返回结构化协议错误
    Server { errcode: String, message: String },
    /// 出站内容校验失败或服务端确认拒绝（不重试）
    Validation(String),
    /// 入站数据解码失败（仅中止当前一次 sync）
    Decode(String),
    /// 配置错误
    Config(String),
    /// 同步循环已在运行
    AlreadyRunning,
    /// 尚未登录
    NotLoggedIn,
    /// 非 Application Service 模式下调用了 AS 专属操作
    NotAppService,
    Other(String),
}

impl fmt::Display for MatrixSdkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixSdkError::Transport(e) => write!(f, "Transport error: {}", e),
            MatrixSdkError::Server { errcode, message } => {
                write!(f, "Server error [{}]: {}", errcode, message)
            }
            MatrixSdkError::Validation(e) => write!(f, "Validation error: {}", e),
            MatrixSdkError::Decode(e) => write!(f, "Decode error: {}", e),
            MatrixSdkError::Config(e) => write!(f, "Config error: {}", e),
            MatrixSdkError::AlreadyRunning => write!(f, "Sync loop already running"),
            MatrixSdkError::NotLoggedIn => write!(f, "Not logged in"),
            MatrixSdkError::NotAppService => {
                write!(f, "Client is not registered as an application service")
            }
            MatrixSdkError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for MatrixSdkError {}

impl From<serde_json::Error> for MatrixSdkError {
    fn from(error: serde_json::Error) -> Self {
        MatrixSdkError::Decode(error.to_string())
    }
}

impl MatrixSdkError {
    /// 解析出服务端错误码（如果这是一个协议错误）
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            MatrixSdkError::Server { errcode, .. } => Some(ErrorCode::from_errcode(errcode)),
            _ => None,
        }
    }

    /// 判断出站投递失败后是否值得重试
    ///
    /// Transport 类一律重试；Server 类看 errcode 是否为永久拒绝；
    /// Validation 类永不重试。
    pub fn is_retryable(&self) -> bool {
        match self {
            MatrixSdkError::Transport(_) => true,
            MatrixSdkError::Server { errcode, .. } => {
                !ErrorCode::from_errcode(errcode).is_permanent_rejection()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MatrixSdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errcode_classification() {
        assert!(ErrorCode::from_errcode("M_UNKNOWN").is_permanent_rejection());
        assert!(ErrorCode::from_errcode("M_FORBIDDEN").is_permanent_rejection());
        assert!(!ErrorCode::from_errcode("M_LIMIT_EXCEEDED").is_permanent_rejection());
        assert!(!ErrorCode::from_errcode("M_SOMETHING_NEW").is_permanent_rejection());
    }

    #[test]
    fn test_retryable() {
        assert!(MatrixSdkError::Transport("timeout".into()).is_retryable());
        assert!(MatrixSdkError::Server {
            errcode: "M_LIMIT_EXCEEDED".into(),
            message: "slow down".into()
        }
        .is_retryable());
        assert!(!MatrixSdkError::Server {
            errcode: "M_UNKNOWN".into(),
            message: "rejected".into()
        }
        .is_retryable());
        assert!(!MatrixSdkError::Validation("missing body".into()).is_retryable());
    }
}
