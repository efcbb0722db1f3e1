//! Standard exit codes for CLI operations
//!
//! These exit codes follow Unix conventions and sysexits.h where applicable.

#![allow(dead_code)]

/// Success - operation completed without errors
pub const SUCCESS: i32 = 0;

/// General error - unspecified failure
pub const ERROR: i32 = 1;

/// Configuration error - invalid airpack.yaml, import or command input
pub const CONFIGURATION_ERROR: i32 = 2;

/// Integrity error - checksum or signature mismatch
pub const INTEGRITY_ERROR: i32 = 3;

/// Package error - assembling, archiving or publishing failed
pub const PACKAGE_ERROR: i32 = 4;

/// IO error - file not found, permission denied, etc.
pub const IO_ERROR: i32 = 5;

/// Network error - registry or download failure
pub const NETWORK_ERROR: i32 = 6;

/// Usage error - invalid arguments or options (following sysexits.h convention)
pub const USAGE_ERROR: i32 = 64;

/// Interrupted by the user
pub const CANCELLED: i32 = 130;
