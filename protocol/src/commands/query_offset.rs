use crate::ResponseCode;

/// Response to a stored-offset query for a named consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOffsetResponse {
    code: ResponseCode,
    offset: u64,
}

impl QueryOffsetResponse {
    pub fn new(code: ResponseCode, offset: u64) -> Self {
        QueryOffsetResponse { code, offset }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub fn code(&self) -> ResponseCode {
        self.code
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}
