//! Error types for the automotive protocol stack.
//!
//! This module provides a unified error handling system for all layers of the protocol stack,
//! from the physical layer (CAN) up through the J1939 network layer.

use std::error::Error;
use std::fmt;

/// Represents all possible errors that can occur in the automotive protocol stack.
///
/// This enum encompasses errors from all layers of the protocol stack, providing
/// specific error variants for each protocol as well as generic error conditions.
#[derive(Debug)]
pub enum AutomotiveError {
    /// Errors related to CAN bus operations
    CanError(String),
    /// Errors specific to CAN-FD operations
    CanFdError(String),

    /// Errors specific to J1939 protocol operations
    J1939Error(J1939Error),

    /// Operation timed out
    Timeout,
    /// Buffer capacity exceeded
    BufferOverflow,
    /// Invalid parameter provided to function
    InvalidParameter,
    /// Component used before initialization
    NotInitialized,
    /// Error related to hardware port operations
    PortError(String),
}

impl fmt::Display for AutomotiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomotiveError::CanError(msg) => write!(f, "CAN error: {}", msg),
            AutomotiveError::CanFdError(msg) => write!(f, "CAN FD error: {}", msg),
            AutomotiveError::J1939Error(err) => write!(f, "J1939 error: {}", err),
            AutomotiveError::Timeout => write!(f, "Operation timed out"),
            AutomotiveError::BufferOverflow => write!(f, "Buffer overflow"),
            AutomotiveError::InvalidParameter => write!(f, "Invalid parameter"),
            AutomotiveError::NotInitialized => write!(f, "Component not initialized"),
            AutomotiveError::PortError(msg) => write!(f, "Port error: {}", msg),
        }
    }
}

impl Error for AutomotiveError {}

impl From<J1939Error> for AutomotiveError {
    fn from(err: J1939Error) -> Self {
        AutomotiveError::J1939Error(err)
    }
}

/// A specialized Result type for automotive operations.
///
/// This type is used throughout the crate for any operation that can produce an error.
pub type Result<T> = std::result::Result<T, AutomotiveError>;

/// Structured error kinds specific to the J1939 stack (transport, address-claim,
/// memory-access and validation). Kept as a typed tree rather than a bare string so
/// callers can match on the failure instead of parsing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum J1939Error {
    /// A send-direction transport session already exists for this address pair.
    BusyLocal,
    /// The peer reported BUSY for a transport or memory-access request.
    BusyRemote,
    /// No session slot available (J1939-22 session pool exhausted).
    ResourcesExhausted,
    /// A transport session's deadline elapsed without completion.
    TpTimeout,
    /// The peer sent (or we sent) an ABORT with the given reason code.
    TpAbort(TpAbortReason),
    /// A transport data frame arrived with an out-of-order sequence number.
    SequenceError,
    /// The controller application could not acquire a source address.
    CannotClaim,
    /// Memory-access (DM14-DM18) failure, carrying the decoded error/edcp pair.
    MemoryAccess(MemoryAccessError),
    /// A field failed its range check (NAME, PGN, address, ...).
    BadField(&'static str),
    /// A payload was too short to be a valid message of its kind.
    BadLength,
    /// No response was received from the peer before the caller's timeout.
    NoResponse,
}

impl fmt::Display for J1939Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            J1939Error::BusyLocal => write!(f, "a local session is already active for this address pair"),
            J1939Error::BusyRemote => write!(f, "peer reported busy"),
            J1939Error::ResourcesExhausted => write!(f, "no transport session slot available"),
            J1939Error::TpTimeout => write!(f, "transport session timed out"),
            J1939Error::TpAbort(reason) => write!(f, "transport session aborted: {}", reason),
            J1939Error::SequenceError => write!(f, "out-of-order transport sequence number"),
            J1939Error::CannotClaim => write!(f, "controller application could not claim an address"),
            J1939Error::MemoryAccess(err) => write!(f, "memory-access error: {}", err),
            J1939Error::BadField(name) => write!(f, "field out of range: {}", name),
            J1939Error::BadLength => write!(f, "payload too short"),
            J1939Error::NoResponse => write!(f, "no response from peer"),
        }
    }
}

/// TP.CM ABORT / FD.TP.CM ABORT reason codes (SAE J1939-21 / -22).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpAbortReason {
    Busy,
    Resources,
    Timeout,
    CtsWhileDt,
    Other(u8),
}

impl TpAbortReason {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => TpAbortReason::Busy,
            2 => TpAbortReason::Resources,
            3 => TpAbortReason::Timeout,
            4 => TpAbortReason::CtsWhileDt,
            other => TpAbortReason::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            TpAbortReason::Busy => 1,
            TpAbortReason::Resources => 2,
            TpAbortReason::Timeout => 3,
            TpAbortReason::CtsWhileDt => 4,
            TpAbortReason::Other(code) => code,
        }
    }
}

impl fmt::Display for TpAbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TpAbortReason::Busy => write!(f, "busy"),
            TpAbortReason::Resources => write!(f, "resources unavailable"),
            TpAbortReason::Timeout => write!(f, "timeout"),
            TpAbortReason::CtsWhileDt => write!(f, "CTS received while sending DT"),
            TpAbortReason::Other(code) => write!(f, "unknown reason {:#04x}", code),
        }
    }
}

/// Numeric J1939 memory-access error codes, mirroring SAE Mobilus guidance.
///
/// One variant per value of DM15's 3-byte error field, so a caller can match on
/// the failure category instead of re-decoding the numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccessError {
    NoError,
    UnknownError,
    Busy,
    BusyEraseRequest,
    BusyReadRequest,
    BusyWriteRequest,
    BusyStatusRequest,
    BusyBootLoadRequest,
    BusyEdcpGenerationRequest,
    BusyUnknownRequest,
    EdcParameterError,
    RamError,
    FlashError,
    PromError,
    InternalError,
    GeneralAddressingError,
    AddressNotOnBoundary,
    AddressInvalidLength,
    AddressMemoryOverflow,
    AddressDataEraseRequired,
    AddressProgramEraseRequired,
    AddressTxEraseProgramRequired,
    AddressBootLoadOutOfRange,
    AddressBootLoadNotOnBoundary,
    DataOutOfRange,
    DataNameUnexpected,
    SecurityGeneral,
    SecurityInvalidPassword,
    SecurityInvalidLevel,
    SecurityInvalidKey,
    SecurityNotDiagnostic,
    SecurityIncorrectMode,
    SecurityEngineRunning,
    SecurityVehicleMoving,
    AbortExternal,
    MaxRetry,
    NoResponse,
    InitializationTimeout,
    CompletionTimeout,
    NoIndicator,
    /// A code with no entry in the table above; carries the raw error and edcp bytes.
    Unknown { code: u32, edcp: u8 },
}

impl MemoryAccessError {
    /// Decode the 3-byte DM15 error field (plus the edcp byte) into a typed error.
    pub fn from_code(code: u32, edcp: u8) -> Self {
        match code {
            0x0 => MemoryAccessError::NoError,
            0x1 => MemoryAccessError::UnknownError,
            0x2 => MemoryAccessError::Busy,
            0x10 => MemoryAccessError::BusyEraseRequest,
            0x11 => MemoryAccessError::BusyReadRequest,
            0x12 => MemoryAccessError::BusyWriteRequest,
            0x13 => MemoryAccessError::BusyStatusRequest,
            0x16 => MemoryAccessError::BusyBootLoadRequest,
            0x17 => MemoryAccessError::BusyEdcpGenerationRequest,
            0x1F => MemoryAccessError::BusyUnknownRequest,
            0x20 => MemoryAccessError::EdcParameterError,
            0x21 => MemoryAccessError::RamError,
            0x22 => MemoryAccessError::FlashError,
            0x23 => MemoryAccessError::PromError,
            0x24 => MemoryAccessError::InternalError,
            0x100 => MemoryAccessError::GeneralAddressingError,
            0x101 => MemoryAccessError::AddressNotOnBoundary,
            0x102 => MemoryAccessError::AddressInvalidLength,
            0x103 => MemoryAccessError::AddressMemoryOverflow,
            0x104 => MemoryAccessError::AddressDataEraseRequired,
            0x105 => MemoryAccessError::AddressProgramEraseRequired,
            0x106 => MemoryAccessError::AddressTxEraseProgramRequired,
            0x107 => MemoryAccessError::AddressBootLoadOutOfRange,
            0x108 => MemoryAccessError::AddressBootLoadNotOnBoundary,
            0x109 => MemoryAccessError::DataOutOfRange,
            0x10A => MemoryAccessError::DataNameUnexpected,
            0x1000 => MemoryAccessError::SecurityGeneral,
            0x1001 => MemoryAccessError::SecurityInvalidPassword,
            0x1002 => MemoryAccessError::SecurityInvalidLevel,
            0x1003 => MemoryAccessError::SecurityInvalidKey,
            0x1004 => MemoryAccessError::SecurityNotDiagnostic,
            0x1005 => MemoryAccessError::SecurityIncorrectMode,
            0x1006 => MemoryAccessError::SecurityEngineRunning,
            0x1007 => MemoryAccessError::SecurityVehicleMoving,
            0x10000 => MemoryAccessError::AbortExternal,
            0x10001 => MemoryAccessError::MaxRetry,
            0x10002 => MemoryAccessError::NoResponse,
            0x10003 => MemoryAccessError::InitializationTimeout,
            0x10004 => MemoryAccessError::CompletionTimeout,
            0xFFFFFF => MemoryAccessError::NoIndicator,
            other => MemoryAccessError::Unknown { code: other, edcp },
        }
    }

    /// Encode back to the numeric code used on the wire (edcp travels separately).
    pub fn code(self) -> u32 {
        match self {
            MemoryAccessError::NoError => 0x0,
            MemoryAccessError::UnknownError => 0x1,
            MemoryAccessError::Busy => 0x2,
            MemoryAccessError::BusyEraseRequest => 0x10,
            MemoryAccessError::BusyReadRequest => 0x11,
            MemoryAccessError::BusyWriteRequest => 0x12,
            MemoryAccessError::BusyStatusRequest => 0x13,
            MemoryAccessError::BusyBootLoadRequest => 0x16,
            MemoryAccessError::BusyEdcpGenerationRequest => 0x17,
            MemoryAccessError::BusyUnknownRequest => 0x1F,
            MemoryAccessError::EdcParameterError => 0x20,
            MemoryAccessError::RamError => 0x21,
            MemoryAccessError::FlashError => 0x22,
            MemoryAccessError::PromError => 0x23,
            MemoryAccessError::InternalError => 0x24,
            MemoryAccessError::GeneralAddressingError => 0x100,
            MemoryAccessError::AddressNotOnBoundary => 0x101,
            MemoryAccessError::AddressInvalidLength => 0x102,
            MemoryAccessError::AddressMemoryOverflow => 0x103,
            MemoryAccessError::AddressDataEraseRequired => 0x104,
            MemoryAccessError::AddressProgramEraseRequired => 0x105,
            MemoryAccessError::AddressTxEraseProgramRequired => 0x106,
            MemoryAccessError::AddressBootLoadOutOfRange => 0x107,
            MemoryAccessError::AddressBootLoadNotOnBoundary => 0x108,
            MemoryAccessError::DataOutOfRange => 0x109,
            MemoryAccessError::DataNameUnexpected => 0x10A,
            MemoryAccessError::SecurityGeneral => 0x1000,
            MemoryAccessError::SecurityInvalidPassword => 0x1001,
            MemoryAccessError::SecurityInvalidLevel => 0x1002,
            MemoryAccessError::SecurityInvalidKey => 0x1003,
            MemoryAccessError::SecurityNotDiagnostic => 0x1004,
            MemoryAccessError::SecurityIncorrectMode => 0x1005,
            MemoryAccessError::SecurityEngineRunning => 0x1006,
            MemoryAccessError::SecurityVehicleMoving => 0x1007,
            MemoryAccessError::AbortExternal => 0x10000,
            MemoryAccessError::MaxRetry => 0x10001,
            MemoryAccessError::NoResponse => 0x10002,
            MemoryAccessError::InitializationTimeout => 0x10003,
            MemoryAccessError::CompletionTimeout => 0x10004,
            MemoryAccessError::NoIndicator => 0xFFFFFF,
            MemoryAccessError::Unknown { code, .. } => code,
        }
    }
}

impl fmt::Display for MemoryAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MemoryAccessError::NoError => "no error",
            MemoryAccessError::UnknownError => "unknown error",
            MemoryAccessError::Busy => "busy",
            MemoryAccessError::BusyEraseRequest => "busy: erase request",
            MemoryAccessError::BusyReadRequest => "busy: read request",
            MemoryAccessError::BusyWriteRequest => "busy: write request",
            MemoryAccessError::BusyStatusRequest => "busy: status request",
            MemoryAccessError::BusyBootLoadRequest => "busy: boot load request",
            MemoryAccessError::BusyEdcpGenerationRequest => "busy: EDCP generation request",
            MemoryAccessError::BusyUnknownRequest => "busy: unknown request",
            MemoryAccessError::EdcParameterError => "EDC parameter error",
            MemoryAccessError::RamError => "RAM error",
            MemoryAccessError::FlashError => "flash error",
            MemoryAccessError::PromError => "PROM error",
            MemoryAccessError::InternalError => "internal error",
            MemoryAccessError::GeneralAddressingError => "general addressing error",
            MemoryAccessError::AddressNotOnBoundary => "address: not on boundary",
            MemoryAccessError::AddressInvalidLength => "address: invalid length",
            MemoryAccessError::AddressMemoryOverflow => "address: memory overflow",
            MemoryAccessError::AddressDataEraseRequired => "address: data erase required",
            MemoryAccessError::AddressProgramEraseRequired => "address: program erase required",
            MemoryAccessError::AddressTxEraseProgramRequired => "address: TX erase program required",
            MemoryAccessError::AddressBootLoadOutOfRange => "address: boot load out of range",
            MemoryAccessError::AddressBootLoadNotOnBoundary => "address: boot load not on boundary",
            MemoryAccessError::DataOutOfRange => "data out of range",
            MemoryAccessError::DataNameUnexpected => "data name unexpected",
            MemoryAccessError::SecurityGeneral => "security: general",
            MemoryAccessError::SecurityInvalidPassword => "security: invalid password",
            MemoryAccessError::SecurityInvalidLevel => "security: invalid level",
            MemoryAccessError::SecurityInvalidKey => "security: invalid key",
            MemoryAccessError::SecurityNotDiagnostic => "security: not diagnostic",
            MemoryAccessError::SecurityIncorrectMode => "security: incorrect mode",
            MemoryAccessError::SecurityEngineRunning => "security: engine running",
            MemoryAccessError::SecurityVehicleMoving => "security: vehicle moving",
            MemoryAccessError::AbortExternal => "abort external",
            MemoryAccessError::MaxRetry => "max retry",
            MemoryAccessError::NoResponse => "no response",
            MemoryAccessError::InitializationTimeout => "initialization timeout",
            MemoryAccessError::CompletionTimeout => "completion timeout",
            MemoryAccessError::NoIndicator => "no indicator",
            MemoryAccessError::Unknown { code, edcp } => {
                return write!(f, "unknown error {:#x} (edcp {:#04x})", code, edcp)
            }
        };
        write!(f, "{}", text)
    }
}
