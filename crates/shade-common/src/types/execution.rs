//! Remote call types

use serde::{Deserialize, Serialize};

/// Calling convention for remote calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CallingConvention {
    /// C calling convention (caller cleans stack)
    Cdecl,
    /// Standard x86 convention (callee cleans stack)
    Stdcall,
    /// ecx = this pointer, rest on stack
    Thiscall,
    /// First two compatible args in ecx/edx
    Fastcall,
    /// Microsoft x64 convention, first four args in rcx/rdx/r8/r9
    #[default]
    Win64,
}

impl CallingConvention {
    /// Parse calling convention from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cdecl" | "c" => Some(Self::Cdecl),
            "stdcall" | "std" | "winapi" => Some(Self::Stdcall),
            "thiscall" | "this" => Some(Self::Thiscall),
            "fastcall" | "fast" => Some(Self::Fastcall),
            "win64" | "x64" | "ms64" => Some(Self::Win64),
            _ => None,
        }
    }

    /// Number of arguments passed in registers
    pub fn register_args(&self) -> usize {
        match self {
            Self::Cdecl | Self::Stdcall => 0,
            Self::Thiscall => 1,
            Self::Fastcall => 2,
            Self::Win64 => 4,
        }
    }

    /// Whether the caller pops the stack arguments after the call
    pub fn caller_cleans(&self) -> bool {
        matches!(self, Self::Cdecl | Self::Win64)
    }
}

/// One remote call argument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteArg {
    /// Integer or handle value
    Int(u64),
    /// Pointer into the target
    Pointer(u64),
    /// UTF-16 string, copied into the call context and passed by pointer
    WideString(String),
    /// Raw bytes, copied into the call context and passed by pointer
    Bytes(Vec<u8>),
}

impl RemoteArg {
    /// Immediate representation, if the value needs no spill allocation
    pub fn immediate(&self) -> Option<u64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Pointer(v) => Some(*v),
            Self::WideString(_) | Self::Bytes(_) => None,
        }
    }
}

/// Options for one remote call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOptions {
    pub convention: CallingConvention,
    /// Bounded wait for completion, milliseconds
    pub timeout_ms: u64,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            convention: CallingConvention::Win64,
            timeout_ms: 5000,
        }
    }
}

/// Result of a remote call
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CallResult {
    /// Full-width return value read from the result cell
    pub value: u64,
    /// 32-bit status view of the return value
    pub status: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_convention() {
        assert_eq!(
            CallingConvention::parse("fastcall"),
            Some(CallingConvention::Fastcall)
        );
        assert_eq!(
            CallingConvention::parse("x64"),
            Some(CallingConvention::Win64)
        );
        assert_eq!(CallingConvention::parse("pascal"), None);
    }

    #[test]
    fn test_register_args() {
        assert_eq!(CallingConvention::Stdcall.register_args(), 0);
        assert_eq!(CallingConvention::Thiscall.register_args(), 1);
        assert_eq!(CallingConvention::Fastcall.register_args(), 2);
        assert_eq!(CallingConvention::Win64.register_args(), 4);
    }

    #[test]
    fn test_immediate() {
        assert_eq!(RemoteArg::Int(7).immediate(), Some(7));
        assert_eq!(RemoteArg::Pointer(0x1000).immediate(), Some(0x1000));
        assert_eq!(RemoteArg::WideString("x".into()).immediate(), None);
    }
}
