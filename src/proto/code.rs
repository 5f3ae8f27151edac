//! Response codes carried by discovery responses.
//!
//! Codes are grouped in HTTP-like bands, `code / 1000` gives 200, 400, 401,
//! 404 or 500.

use crate::ReturnCode;

pub const EXECUTE_SUCCESS: u32 = 200_000;
pub const DATA_NO_CHANGE: u32 = 200_001;

pub const EXISTED_RESOURCE: u32 = 400_201;
pub const NOT_FOUND_RESOURCE: u32 = 400_202;
pub const NOT_FOUND_SERVICE: u32 = 400_301;
pub const NOT_FOUND_ROUTING: u32 = 400_302;
pub const NOT_FOUND_INSTANCE: u32 = 400_303;
pub const NOT_FOUND_RATE_LIMIT: u32 = 400_304;
pub const NOT_FOUND_CIRCUIT_BREAKER: u32 = 400_305;
pub const NOT_FOUND_SOURCE_SERVICE: u32 = 400_306;
pub const HEALTH_CHECK_NOT_OPEN: u32 = 400_401;
pub const HEARTBEAT_ON_DISABLED_INS: u32 = 400_402;
pub const HEARTBEAT_EXCEED_LIMIT: u32 = 400_403;

pub const UNAUTHORIZED: u32 = 401_000;
pub const REQUEST_LIMIT_USER: u32 = 403_001;
pub const REQUEST_LIMIT_API: u32 = 403_002;

pub const EXECUTE_EXCEPTION: u32 = 500_000;

#[inline]
pub fn band(code: u32) -> u32 {
    code / 1000
}

#[inline]
pub fn is_success(code: u32) -> bool {
    band(code) == 200
}

/// Codes reporting a missing service or rule.
pub fn is_not_found(code: u32) -> bool {
    (NOT_FOUND_RESOURCE..=NOT_FOUND_SOURCE_SERVICE).contains(&code)
}

fn bad_request_to_return_code(code: u32) -> ReturnCode {
    if is_not_found(code) {
        if code == NOT_FOUND_INSTANCE {
            return ReturnCode::InstanceNotFound;
        }
        return ReturnCode::ServiceNotFound;
    }
    match code {
        HEALTH_CHECK_NOT_OPEN | HEARTBEAT_ON_DISABLED_INS => ReturnCode::HealthCheckDisabled,
        HEARTBEAT_EXCEED_LIMIT => ReturnCode::RateLimit,
        EXISTED_RESOURCE => ReturnCode::ExistedResource,
        _ => ReturnCode::InvalidArgument,
    }
}

/// Converts a server response code into the client return code.
pub fn to_return_code(code: u32) -> ReturnCode {
    match band(code) {
        200 => ReturnCode::Ok,
        500 => ReturnCode::ServerError,
        400 => bad_request_to_return_code(code),
        401 => ReturnCode::Unauthorized,
        404 => ReturnCode::ResourceNotFound,
        _ => ReturnCode::UnknownError,
    }
}
