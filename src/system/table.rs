//! System handle table and object type table parsing.
//!
//! Both tables come back from the OS as raw byte blocks. Records are read
//! field by field at fixed offsets instead of being cast in place, so a block
//! with an unexpected length is reported as a `ParseError` rather than read
//! out of bounds.
//!
//! Layouts (pointer-width dependent, `P` = size of a pointer):
//!
//! ```text
//! SYSTEM_HANDLE_INFORMATION_EX           SYSTEM_HANDLE_TABLE_ENTRY_INFO_EX
//!   NumberOfHandles   P                    Object                 P
//!   Reserved          P                    UniqueProcessId        P
//!   Handles[]                              HandleValue            P
//!                                          GrantedAccess          u32
//!                                          CreatorBackTraceIndex  u16
//!                                          ObjectTypeIndex        u16
//!                                          HandleAttributes       u32
//!                                          Reserved               u32
//! ```

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ScanError, Stage};

// ─── Layout helpers ──────────────────────────────────────────────────────────

pub const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Round `value` up to the next multiple of the pointer size.
pub const fn align_up(value: usize) -> usize {
    (value + POINTER_SIZE - 1) & !(POINTER_SIZE - 1)
}

pub const HANDLE_TABLE_HEADER_SIZE: usize = 2 * POINTER_SIZE;
pub const HANDLE_ENTRY_SIZE: usize = align_up(3 * POINTER_SIZE + 16);

// UNICODE_STRING is { u16 Length, u16 MaximumLength, <pad>, PWSTR Buffer }
const UNICODE_STRING_SIZE: usize = align_up(4) + POINTER_SIZE;
// OBJECT_TYPE_INFORMATION: the name, then 88 bytes of counters and flags
const TYPE_INFO_SIZE: usize = UNICODE_STRING_SIZE + 88;
const TYPE_INDEX_OFFSET: usize = UNICODE_STRING_SIZE + 74;
// The first kernel object type index; 0 and 1 are reserved
const FIRST_TYPE_INDEX: u16 = 2;

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let raw = bytes.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_ne_bytes(raw.try_into().ok()?))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_ne_bytes(raw.try_into().ok()?))
}

fn read_usize(bytes: &[u8], offset: usize) -> Option<usize> {
    let raw = bytes.get(offset..offset.checked_add(POINTER_SIZE)?)?;
    Some(usize::from_ne_bytes(raw.try_into().ok()?))
}

pub(crate) fn read_utf16(bytes: &[u8], offset: usize, byte_len: usize) -> Option<String> {
    let raw = bytes.get(offset..offset.checked_add(byte_len)?)?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect();
    Some(String::from_utf16_lossy(&units))
}

// ─── Handle table ────────────────────────────────────────────────────────────

/// One open handle in some process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleTableEntry {
    pub pid: u32,
    /// Handle value, only meaningful inside the owning process.
    pub handle: usize,
    pub type_code: u16,
    /// Kernel object address; equal for handles that share one object.
    pub object: usize,
    pub granted_access: u32,
    pub attributes: u32,
}

/// Parse a `SystemExtendedHandleInformation` block.
pub fn parse_handle_table(bytes: &[u8]) -> Result<Vec<HandleTableEntry>, ScanError> {
    let stage = Stage::HandleTable;
    let count = read_usize(bytes, 0).ok_or_else(|| {
        ScanError::parse(stage, format!("{} bytes is shorter than the header", bytes.len()))
    })?;

    let expected = count
        .checked_mul(HANDLE_ENTRY_SIZE)
        .and_then(|n| n.checked_add(HANDLE_TABLE_HEADER_SIZE))
        .ok_or_else(|| ScanError::parse(stage, format!("entry count {count} overflows")))?;
    if expected > bytes.len() {
        return Err(ScanError::parse(
            stage,
            format!("{count} entries need {expected} bytes but only {} were returned", bytes.len()),
        ));
    }
    if bytes.len() - expected >= HANDLE_ENTRY_SIZE {
        return Err(ScanError::parse(
            stage,
            format!("{count} entries need {expected} bytes but {} were returned", bytes.len()),
        ));
    }

    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
        let base = HANDLE_TABLE_HEADER_SIZE + index * HANDLE_ENTRY_SIZE;
        let entry = read_handle_entry(bytes, base)
            .ok_or_else(|| ScanError::parse(stage, format!("entry {index} is truncated")))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn read_handle_entry(bytes: &[u8], base: usize) -> Option<HandleTableEntry> {
    let p = POINTER_SIZE;
    Some(HandleTableEntry {
        object: read_usize(bytes, base)?,
        pid: read_usize(bytes, base + p)? as u32,
        handle: read_usize(bytes, base + 2 * p)?,
        granted_access: read_u32(bytes, base + 3 * p)?,
        type_code: read_u16(bytes, base + 3 * p + 6)?,
        attributes: read_u32(bytes, base + 3 * p + 8)?,
    })
}

/// Serialize entries in the layout `parse_handle_table` reads.
///
/// Used by in-memory sources that replay a captured or synthetic table.
pub fn encode_handle_table(entries: &[HandleTableEntry]) -> Vec<u8> {
    let mut bytes = vec![0u8; HANDLE_TABLE_HEADER_SIZE + entries.len() * HANDLE_ENTRY_SIZE];
    bytes[..POINTER_SIZE].copy_from_slice(&entries.len().to_ne_bytes());

    let p = POINTER_SIZE;
    for (index, entry) in entries.iter().enumerate() {
        let base = HANDLE_TABLE_HEADER_SIZE + index * HANDLE_ENTRY_SIZE;
        bytes[base..base + p].copy_from_slice(&entry.object.to_ne_bytes());
        bytes[base + p..base + 2 * p].copy_from_slice(&(entry.pid as usize).to_ne_bytes());
        bytes[base + 2 * p..base + 3 * p].copy_from_slice(&entry.handle.to_ne_bytes());
        bytes[base + 3 * p..base + 3 * p + 4].copy_from_slice(&entry.granted_access.to_ne_bytes());
        bytes[base + 3 * p + 6..base + 3 * p + 8].copy_from_slice(&entry.type_code.to_ne_bytes());
        bytes[base + 3 * p + 8..base + 3 * p + 12].copy_from_slice(&entry.attributes.to_ne_bytes());
    }
    bytes
}

// ─── Object type table ───────────────────────────────────────────────────────

/// Kernel object type names by type code.
///
/// Type codes are assigned at boot and differ between OS builds, so they are
/// looked up by name from the live table instead of being hardcoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeTable {
    names: BTreeMap<u16, String>,
}

impl TypeTable {
    pub fn from_names<'a>(names: impl IntoIterator<Item = (u16, &'a str)>) -> Self {
        Self {
            names: names
                .into_iter()
                .map(|(code, name)| (code, name.to_string()))
                .collect(),
        }
    }

    /// Parse an `ObjectTypesInformation` block.
    ///
    /// Each `OBJECT_TYPE_INFORMATION` record is followed by its name buffer,
    /// and the next record starts at the next pointer-aligned offset.
    pub fn parse(bytes: &[u8]) -> Result<Self, ScanError> {
        let stage = Stage::TypeTable;
        let count = read_u32(bytes, 0)
            .ok_or_else(|| ScanError::parse(stage, "block is shorter than the header"))?;

        let count = count as usize;
        let room = bytes.len().saturating_sub(align_up(4));
        if count.saturating_mul(TYPE_INFO_SIZE) > room {
            return Err(ScanError::parse(
                stage,
                format!("{count} type records cannot fit in {} bytes", bytes.len()),
            ));
        }

        let mut names = BTreeMap::new();
        let mut offset = align_up(4);
        for position in 0..count {
            let truncated = || ScanError::parse(stage, format!("type record {position} is truncated"));

            let name_len = read_u16(bytes, offset).ok_or_else(truncated)? as usize;
            let name_max = read_u16(bytes, offset + 2).ok_or_else(truncated)? as usize;
            if name_len > name_max {
                return Err(ScanError::parse(
                    stage,
                    format!("type record {position} name length {name_len} exceeds its buffer {name_max}"),
                ));
            }
            let index = *bytes.get(offset + TYPE_INDEX_OFFSET).ok_or_else(truncated)?;
            let name = read_utf16(bytes, offset + TYPE_INFO_SIZE, name_len).ok_or_else(truncated)?;

            let code = if index != 0 {
                index as u16
            } else {
                u16::try_from(position)
                    .ok()
                    .and_then(|p| p.checked_add(FIRST_TYPE_INDEX))
                    .ok_or_else(|| {
                        ScanError::parse(stage, format!("type record {position} has no representable index"))
                    })?
            };
            names.insert(code, name);

            offset = align_up(offset + TYPE_INFO_SIZE + name_max);
        }

        Ok(Self { names })
    }

    /// Type codes whose names match any of `names`, ignoring case.
    pub fn codes_for<S: AsRef<str>>(&self, names: &[S]) -> BTreeSet<u16> {
        self.names
            .iter()
            .filter(|(_, name)| names.iter().any(|n| n.as_ref().eq_ignore_ascii_case(name)))
            .map(|(&code, _)| code)
            .collect()
    }

    pub fn name(&self, code: u16) -> Option<&str> {
        self.names.get(&code).map(String::as_str)
    }

    /// Display label for a type code, `Type<N>` when unknown.
    pub fn label(&self, code: u16) -> String {
        match self.name(code) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("Type{}", code),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Serialize `(code, name)` pairs in the layout `TypeTable::parse` reads.
pub fn encode_type_table(types: &[(u16, &str)]) -> Vec<u8> {
    let mut bytes = vec![0u8; align_up(4)];
    bytes[..4].copy_from_slice(&(types.len() as u32).to_ne_bytes());

    for &(code, name) in types {
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_len = units.len() * 2;
        // Room for a terminating NUL, like the OS leaves
        let name_max = name_len + 2;

        let offset = bytes.len();
        bytes.resize(align_up(offset + TYPE_INFO_SIZE + name_max), 0);
        bytes[offset..offset + 2].copy_from_slice(&(name_len as u16).to_ne_bytes());
        bytes[offset + 2..offset + 4].copy_from_slice(&(name_max as u16).to_ne_bytes());
        bytes[offset + TYPE_INDEX_OFFSET] = code as u8;
        for (i, unit) in units.iter().enumerate() {
            let at = offset + TYPE_INFO_SIZE + i * 2;
            bytes[at..at + 2].copy_from_slice(&unit.to_ne_bytes());
        }
    }
    bytes
}
