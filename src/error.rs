use crate::aggregator::types::Symbol;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AggregatorError {
    #[error("invalid decimal in price level: {0}")]
    LevelParse(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("system unhealthy right now, unable to create order")]
    SystemUnhealthy,

    #[error("asset not found: {0}")]
    AssetNotFound(String),

    #[error("symbol not supported: {0}")]
    SymbolNotSupported(Symbol),

    #[error("missing credentials for {0}")]
    MissingCredentials(&'static str),

    #[error("exchange error: {0}")]
    ExchangeError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("websocket error: {0}")]
    WebsocketError(String),

    #[error("websocket ping/pong timeout")]
    KeepaliveTimeout,

    #[error("no {0} in depth snapshot")]
    EmptyBook(&'static str),

    #[error("depth watch cancelled")]
    Cancelled,
}

impl AggregatorError {
    pub fn api<E: std::fmt::Display>(err: E) -> Self {
        AggregatorError::ApiError(err.to_string())
    }

    pub fn ws<E: std::fmt::Display>(err: E) -> Self {
        AggregatorError::WebsocketError(err.to_string())
    }
}
