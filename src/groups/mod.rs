// src/groups/mod.rs
//
// Management group implementations. Each group owns its command ids, a
// mode guard rejecting re-entry while an operation is active, and the
// response decoding for its commands.

pub mod custom;
pub mod enum_mgmt;
pub mod fs;
pub mod img;
pub mod os;
pub mod settings;
pub mod shell;
pub mod stats;
pub mod zephyr;

/// Group identifiers.
pub mod group_id {
    pub const OS: u16 = 0;
    pub const IMG: u16 = 1;
    pub const STATS: u16 = 2;
    pub const SETTINGS: u16 = 3;
    pub const FS: u16 = 8;
    pub const SHELL: u16 = 9;
    pub const ENUM: u16 = 10;
    pub const ZEPHYR: u16 = 63;
}

/// Error-string lookup service keyed by `(group, code)`.
///
/// Codes 0 and 1 (ok / unknown) are shared by every group; per-group
/// tables start at code 2.
pub mod error_lookup {
    use super::group_id;
    use crate::error::GROUP_ERROR_CODE_START;

    const BASE_ERRORS: [&str; 14] = [
        "No error",
        "Unknown error",
        "Insufficient memory",
        "Invalid value",
        "Timeout",
        "No entry",
        "Current state disallows command",
        "Response too large to fit",
        "Command not supported",
        "Payload corrupt",
        "Device busy",
        "Access denied",
        "Requested SMP protocol version is too old",
        "Requested SMP protocol version is too new",
    ];

    const IMG_ERRORS: [&str; 30] = [
        "Failed to query flash area configuration",
        "There is no image in the slot",
        "The image in the slot has no TLVs (tag, length, value)",
        "The image in the slot has an invalid TLV type and/or length",
        "The image in the slot has multiple hash TLVs, which is invalid",
        "The image in the slot has an invalid TLV size",
        "The image in the slot does not have a hash TLV, which is required",
        "There is no free slot to place the image",
        "Flash area opening failed",
        "Flash area reading failed",
        "Flash area writing failed",
        "Flash area erase failed",
        "The provided slot is not valid",
        "Insufficient heap memory (malloc failed)",
        "The flash context is already set",
        "The flash context is not set",
        "The device for the flash area is NULL",
        "The offset for a page number is invalid",
        "The offset parameter was not provided and is required",
        "The length parameter was not provided and is required",
        "The image length is smaller than the size of an image header",
        "The image header magic value does not match the expected value",
        "The hash parameter provided is not valid",
        "The image load address does not match the address of the flash area",
        "Failed to get version of currently running application",
        "The currently running application is newer than the version being uploaded",
        "There is already an image operating pending",
        "The image vector table is invalid",
        "The image it too large to fit",
        "The amount of data sent is larger than the provided image size",
    ];

    const STATS_ERRORS: [&str; 4] = [
        "The provided statistic group name was not found",
        "The provided statistic name was not found",
        "The size of the statistic cannot be handled",
        "Walk through of statistics was aborted",
    ];

    const SETTINGS_ERRORS: [&str; 6] = [
        "The provided key name is too long to be used",
        "The provided key name does not exist",
        "The provided key name does not support being read",
        "The provided root key name does not exist",
        "The provided key name does not support being written",
        "The provided key name does not support being deleted",
    ];

    const FS_ERRORS: [&str; 12] = [
        "The specified file name is not valid",
        "The specified file does not exist",
        "The specified file is a directory, not a file",
        "Error occurred whilst attempting to open a file",
        "Error occurred whilst attempting to seek to an offset in a file",
        "Error occurred whilst attempting to read data from a file",
        "Error occurred whilst trying to truncate file",
        "Error occurred whilst trying to delete file",
        "Error occurred whilst attempting to write data to a file",
        "Specified data offset is not valid",
        "The requested offset is larger than the size of the file on the device",
        "The requested checksum or hash type was not found or is not supported by this build",
    ];

    const SHELL_ERRORS: [&str; 2] = [
        "The provided command to execute is too long",
        "No command to execute was provided",
    ];

    const ENUM_ERRORS: [&str; 2] = [
        "Too many group entries were provided",
        "Insufficient heap memory to store entry data",
    ];

    const ZEPHYR_ERRORS: [&str; 3] = [
        "Opening of the flash area has failed",
        "Querying the flash area parameters has failed",
        "Erasing the flash area has failed",
    ];

    /// Resolve a base (group-independent) status code.
    pub fn base_error_string(rc: i32) -> Option<&'static str> {
        usize::try_from(rc).ok().and_then(|i| BASE_ERRORS.get(i)).copied()
    }

    /// Resolve a group-scoped code against the owning group's table.
    pub fn group_error_string(group: u16, rc: i32) -> Option<&'static str> {
        let table: &[&'static str] = match group {
            group_id::IMG => &IMG_ERRORS,
            group_id::STATS => &STATS_ERRORS,
            group_id::SETTINGS => &SETTINGS_ERRORS,
            group_id::FS => &FS_ERRORS,
            group_id::SHELL => &SHELL_ERRORS,
            group_id::ENUM => &ENUM_ERRORS,
            group_id::ZEPHYR => &ZEPHYR_ERRORS,
            _ => return None,
        };
        usize::try_from(rc - GROUP_ERROR_CODE_START)
            .ok()
            .and_then(|i| table.get(i))
            .copied()
    }

}
