use std::fmt;

use crate::proto::code;

/// Outcome of one exchange with a discovery server.
///
/// Transport errors and protocol codes are both folded into this enum before
/// they reach failover decisions or health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum ServerCode {
    ReturnOk = 2000,
    ConnectError = 2001,
    ServerError = 2002,
    RpcError = 2003,
    RpcTimeout = 2004,
    InvalidResponse = 2005,
    InvalidRequest = 2006,
    Unauthorized = 2007,
    RequestLimit = 2008,
    RemoteClose = 2010,
    UnknownError = 2100,
}

impl ServerCode {
    /// Maps a response code by its band, `(code / 10000) * 10`.
    pub fn from_response_code(response_code: u32) -> Self {
        match (response_code / 10_000) * 10 {
            200 => ServerCode::ReturnOk,
            500 => ServerCode::ServerError,
            400 => match response_code {
                code::UNAUTHORIZED => ServerCode::Unauthorized,
                code::REQUEST_LIMIT_USER | code::REQUEST_LIMIT_API => ServerCode::RequestLimit,
                _ => ServerCode::InvalidRequest,
            },
            _ => ServerCode::UnknownError,
        }
    }

    /// Whether a call ending with this code counts as a failed sample of the
    /// server it was sent to.
    pub fn is_failure(&self) -> bool {
        (ServerCode::ConnectError..=ServerCode::InvalidResponse).contains(self)
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerCode::ReturnOk => "ok",
            ServerCode::ConnectError => "connect_error",
            ServerCode::ServerError => "server_error",
            ServerCode::RpcError => "rpc_error",
            ServerCode::RpcTimeout => "rpc_timeout",
            ServerCode::InvalidResponse => "invalid_response",
            ServerCode::InvalidRequest => "invalid_request",
            ServerCode::Unauthorized => "unauthorized",
            ServerCode::RequestLimit => "request_limit",
            ServerCode::RemoteClose => "remote_close",
            ServerCode::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for ServerCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
