//! AML namespace and interpreter
//!
//! Parses DSDT/SSDT bytecode into a namespace of scoped and leaf objects
//! and evaluates the subset the kernel needs: `_SB_` device enumeration,
//! the `_S0_`..`_S5_` sleep packages, and the `_TTS`/`_PTS`/`_GTS`
//! preparation methods. Unknown opcodes are rejected with their offset,
//! never skipped.
//!
//! Covered opcodes: Zero, One, Ones, Byte/Word/DWord/QWord prefixes,
//! String, Buffer, Package, Name, Scope, Alias, Method (body recorded,
//! executed for Return/Noop/data bodies), and the extended set OpRegion,
//! Field (skipped field lists), Device, Processor, PowerResource,
//! ThermalZone, Mutex, Event.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use core::fmt;

use spin::Mutex;

// Primary opcodes.
const OP_ZERO: u8 = 0x00;
const OP_ONE: u8 = 0x01;
const OP_ALIAS: u8 = 0x06;
const OP_NAME: u8 = 0x08;
const OP_BYTE: u8 = 0x0A;
const OP_WORD: u8 = 0x0B;
const OP_DWORD: u8 = 0x0C;
const OP_STRING: u8 = 0x0D;
const OP_QWORD: u8 = 0x0E;
const OP_SCOPE: u8 = 0x10;
const OP_BUFFER: u8 = 0x11;
const OP_PACKAGE: u8 = 0x12;
const OP_METHOD: u8 = 0x14;
const OP_EXT_PREFIX: u8 = 0x5B;
const OP_NOOP: u8 = 0xA3;
const OP_RETURN: u8 = 0xA4;
const OP_ONES: u8 = 0xFF;

// Extended (0x5B-prefixed) opcodes.
const EXT_MUTEX: u8 = 0x01;
const EXT_EVENT: u8 = 0x02;
const EXT_OPREGION: u8 = 0x80;
const EXT_FIELD: u8 = 0x81;
const EXT_DEVICE: u8 = 0x82;
const EXT_PROCESSOR: u8 = 0x83;
const EXT_POWER_RES: u8 = 0x84;
const EXT_THERMAL_ZONE: u8 = 0x85;

/// AML evaluation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmlError {
    /// Opcode outside the covered subset, with its byte offset.
    UnknownOpcode { op: u8, offset: usize },
    /// Bytecode ran out mid-construct.
    Truncated { offset: usize },
    /// A name string failed to parse.
    BadName { offset: usize },
    /// Lookup failed.
    NotFound,
    /// The object had the wrong shape for the request.
    TypeMismatch,
}

impl fmt::Display for AmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { op, offset } => {
                write!(f, "unknown opcode {:#04x} at offset {:#x}", op, offset)
            }
            Self::Truncated { offset } => write!(f, "truncated stream at offset {:#x}", offset),
            Self::BadName { offset } => write!(f, "malformed name at offset {:#x}", offset),
            Self::NotFound => write!(f, "object not found"),
            Self::TypeMismatch => write!(f, "object type mismatch"),
        }
    }
}

pub type AmlResult<T> = Result<T, AmlError>;

/// An ACPI data value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcpiData {
    Zero,
    One,
    Ones,
    Byte(u8),
    Word(u16),
    DWord(u32),
    QWord(u64),
    String(String),
    Buffer(Vec<u8>),
    Package(Vec<AcpiData>),
}

impl AcpiData {
    /// Integer view of a value, if it has one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Zero => Some(0),
            Self::One => Some(1),
            Self::Ones => Some(u64::MAX),
            Self::Byte(v) => Some(*v as u64),
            Self::Word(v) => Some(*v as u64),
            Self::DWord(v) => Some(*v as u64),
            Self::QWord(v) => Some(*v),
            _ => None,
        }
    }
}

/// A node in the firmware namespace.
#[derive(Debug, Clone)]
pub enum AcpiObj {
    Scope(Namespace),
    Device(Namespace),
    PowerResource {
        system_level: u8,
        resource_order: u16,
        ns: Namespace,
    },
    Processor {
        proc_id: u8,
        pblk_addr: u32,
        pblk_len: u8,
        ns: Namespace,
    },
    ThermalZone(Namespace),
    Method {
        /// Definition block the body lives in.
        block: usize,
        /// Body location within that block.
        offset: usize,
        length: usize,
        arg_count: u8,
    },
    Name(AcpiData),
    OpRegion {
        space: u8,
        offset: u64,
        length: u64,
    },
    Field,
    Mutex {
        sync_level: u8,
    },
    Event,
    Alias(String),
}

impl AcpiObj {
    /// Child namespace of a scoped object.
    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            Self::Scope(ns)
            | Self::Device(ns)
            | Self::ThermalZone(ns)
            | Self::PowerResource { ns, .. }
            | Self::Processor { ns, .. } => Some(ns),
            _ => None,
        }
    }
}

/// A scope: named children in definition order.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    children: BTreeMap<String, AcpiObj>,
}

impl Namespace {
    pub fn get(&self, name: &str) -> Option<&AcpiObj> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = (&String, &AcpiObj)> {
        self.children.iter()
    }

    /// Depth-first search for a name segment anywhere below this scope.
    pub fn find(&self, name: &str) -> Option<&AcpiObj> {
        if let Some(obj) = self.children.get(name) {
            return Some(obj);
        }
        for obj in self.children.values() {
            if let Some(ns) = obj.namespace() {
                if let Some(found) = ns.find(name) {
                    return Some(found);
                }
            }
        }
        None
    }
}

/// Parser cursor over one definition-block byte stream.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn take(&mut self) -> AmlResult<u8> {
        let b = self.peek().ok_or(AmlError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn take_n(&mut self, n: usize) -> AmlResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(AmlError::Truncated { offset: self.pos });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// PkgLength: bits 6-7 of the lead byte count the extra bytes; with
    /// extras, only the low 4 bits of the lead contribute.
    fn pkg_length(&mut self) -> AmlResult<usize> {
        let lead = self.take()?;
        let extra = (lead >> 6) as usize;
        if extra == 0 {
            return Ok((lead & 0x3F) as usize);
        }
        let mut value = (lead & 0x0F) as usize;
        for i in 0..extra {
            let b = self.take()? as usize;
            value |= b << (4 + 8 * i);
        }
        Ok(value)
    }

    /// NameString: optional root/parent prefixes then one, two, or many
    /// four-character segments. Returns the final segment (the kernel
    /// namespace keys on segments).
    fn name_string(&mut self) -> AmlResult<String> {
        let offset = self.pos;
        while matches!(self.peek(), Some(b'\\') | Some(b'^')) {
            self.take()?;
        }
        let segs = match self.peek() {
            Some(0x2E) => {
                self.take()?;
                2
            }
            Some(0x2F) => {
                self.take()?;
                self.take()? as usize
            }
            Some(0x00) => {
                self.take()?;
                return Ok(String::new());
            }
            _ => 1,
        };
        let mut last = String::new();
        for _ in 0..segs {
            let seg = self.take_n(4)?;
            if !seg[0].is_ascii_uppercase() && seg[0] != b'_' {
                return Err(AmlError::BadName { offset });
            }
            if !seg[1..]
                .iter()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || *b == b'_')
            {
                return Err(AmlError::BadName { offset });
            }
            last = core::str::from_utf8(seg)
                .map_err(|_| AmlError::BadName { offset })?
                .to_string();
        }
        Ok(last)
    }

    /// A data object (the DataRefObject subset).
    fn data_object(&mut self) -> AmlResult<AcpiData> {
        let offset = self.pos;
        match self.take()? {
            OP_ZERO => Ok(AcpiData::Zero),
            OP_ONE => Ok(AcpiData::One),
            OP_ONES => Ok(AcpiData::Ones),
            OP_BYTE => Ok(AcpiData::Byte(self.take()?)),
            OP_WORD => {
                let b = self.take_n(2)?;
                Ok(AcpiData::Word(u16::from_le_bytes(b.try_into().unwrap())))
            }
            OP_DWORD => {
                let b = self.take_n(4)?;
                Ok(AcpiData::DWord(u32::from_le_bytes(b.try_into().unwrap())))
            }
            OP_QWORD => {
                let b = self.take_n(8)?;
                Ok(AcpiData::QWord(u64::from_le_bytes(b.try_into().unwrap())))
            }
            OP_STRING => {
                let mut s = Vec::new();
                loop {
                    match self.take()? {
                        0 => break,
                        b => s.push(b),
                    }
                }
                Ok(AcpiData::String(
                    String::from_utf8(s).map_err(|_| AmlError::BadName { offset })?,
                ))
            }
            OP_BUFFER => {
                let len_start = self.pos;
                let pkg = self.pkg_length()?;
                let end = len_start + pkg;
                let size = self
                    .data_object()?
                    .as_u64()
                    .ok_or(AmlError::TypeMismatch)? as usize;
                let avail = end.saturating_sub(self.pos);
                let raw = self.take_n(avail)?;
                let mut buf = Vec::new();
                buf.extend_from_slice(raw);
                buf.resize(size.max(buf.len()), 0);
                Ok(AcpiData::Buffer(buf))
            }
            OP_PACKAGE => {
                let len_start = self.pos;
                let pkg = self.pkg_length()?;
                let end = len_start + pkg;
                let count = self.take()? as usize;
                let mut elements = Vec::with_capacity(count);
                while self.pos < end && elements.len() < count {
                    elements.push(self.data_object()?);
                }
                self.pos = end;
                Ok(AcpiData::Package(elements))
            }
            op => Err(AmlError::UnknownOpcode { op, offset }),
        }
    }
}

/// The interpreter: the root namespace, the named-mutex map, and the
/// scratch stack used while evaluating a method.
#[derive(Debug)]
pub struct AmlState {
    root: Namespace,
    /// Named AML mutexes, shared with method evaluation.
    mutexes: BTreeMap<String, Arc<Mutex<()>>>,
    /// The definition blocks, kept for method bodies.
    blocks: Vec<Vec<u8>>,
}

impl AmlState {
    pub fn new() -> Self {
        Self {
            root: Namespace::default(),
            mutexes: BTreeMap::new(),
            blocks: Vec::new(),
        }
    }

    /// Parse one definition block (a DSDT or SSDT body) into the
    /// namespace.
    pub fn load(&mut self, code: &[u8]) -> AmlResult<()> {
        let block_idx = self.blocks.len();
        let mut owned = Vec::new();
        owned.extend_from_slice(code);
        self.blocks.push(owned);
        let code = &self.blocks[block_idx];
        let mut ns = Namespace::default();
        let mut mutexes = BTreeMap::new();
        {
            let mut cur = Cursor::new(code);
            parse_term_list(&mut cur, code.len(), &mut ns, &mut mutexes)?;
        }
        stamp_methods(&mut ns, block_idx);
        // Merge into the root (later blocks override earlier names).
        for (name, obj) in ns.children {
            self.root.children.insert(name, obj);
        }
        self.mutexes.extend(mutexes);
        Ok(())
    }

    /// Shorthand: parse a single block into a fresh state.
    pub fn parse(code: &[u8]) -> AmlResult<Self> {
        let mut state = Self::new();
        state.load(code)?;
        Ok(state)
    }

    /// Look up an object by name segment anywhere in the tree.
    pub fn get_obj(&self, name: &str) -> Option<&AcpiObj> {
        self.root.find(name)
    }

    pub fn root(&self) -> &Namespace {
        &self.root
    }

    /// Named mutexes discovered in the bytecode.
    pub fn mutex(&self, name: &str) -> Option<Arc<Mutex<()>>> {
        self.mutexes.get(name).cloned()
    }

    /// Evaluate a named object to a data value: `Name` definitions
    /// directly, methods by executing their (restricted) body.
    pub fn evaluate(&self, name: &str) -> AmlResult<AcpiData> {
        let obj = self.get_obj(name).ok_or(AmlError::NotFound)?.clone();
        self.exec(&obj)
    }

    /// Execute a method: the covered body subset is Noop, Return with a
    /// data object, and bare data objects. Anything else is rejected.
    pub fn exec(&self, obj: &AcpiObj) -> AmlResult<AcpiData> {
        match obj {
            AcpiObj::Method {
                block,
                offset,
                length,
                ..
            } => self.exec_body(*block, *offset, *length),
            AcpiObj::Name(data) => Ok(data.clone()),
            _ => Err(AmlError::TypeMismatch),
        }
    }

    fn exec_body(&self, block: usize, offset: usize, length: usize) -> AmlResult<AcpiData> {
        let block = self.blocks.get(block).ok_or(AmlError::NotFound)?;
        if offset + length > block.len() {
            return Err(AmlError::NotFound);
        }
        let body = &block[offset..offset + length];
        let mut cur = Cursor::new(body);
        let mut result = AcpiData::Zero;
        while let Some(op) = cur.peek() {
            match op {
                OP_NOOP => {
                    cur.take()?;
                }
                OP_RETURN => {
                    cur.take()?;
                    return cur.data_object();
                }
                _ => {
                    result = cur.data_object()?;
                }
            }
        }
        Ok(result)
    }

    /// Every `Device` under `_SB_`, for bus enumeration.
    pub fn system_bus_devices(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(AcpiObj::Scope(sb) | AcpiObj::Device(sb)) = self.get_obj("_SB_") {
            for (name, obj) in sb.children() {
                if matches!(obj, AcpiObj::Device(_)) {
                    out.push(name.clone());
                }
            }
        }
        out
    }
}

impl Default for AmlState {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a term list up to `end` (cursor-relative absolute position).
fn parse_term_list(
    cur: &mut Cursor,
    end: usize,
    ns: &mut Namespace,
    mutexes: &mut BTreeMap<String, Arc<Mutex<()>>>,
) -> AmlResult<()> {
    while cur.pos < end {
        let offset = cur.pos;
        let op = cur.take()?;
        match op {
            OP_SCOPE => {
                let len_start = cur.pos;
                let pkg = cur.pkg_length()?;
                let scope_end = len_start + pkg;
                let name = cur.name_string()?;
                let mut child = Namespace::default();
                parse_term_list(cur, scope_end, &mut child, mutexes)?;
                // Re-opening an existing scope merges children.
                match ns.children.get_mut(&name) {
                    Some(existing) => {
                        if let AcpiObj::Scope(old) = existing {
                            old.children.append(&mut child.children);
                        }
                    }
                    None => {
                        ns.children.insert(name, AcpiObj::Scope(child));
                    }
                }
            }
            OP_NAME => {
                let name = cur.name_string()?;
                let data = cur.data_object()?;
                ns.children.insert(name, AcpiObj::Name(data));
            }
            OP_ALIAS => {
                let target = cur.name_string()?;
                let name = cur.name_string()?;
                ns.children.insert(name, AcpiObj::Alias(target));
            }
            OP_METHOD => {
                let len_start = cur.pos;
                let pkg = cur.pkg_length()?;
                let body_end = len_start + pkg;
                let name = cur.name_string()?;
                let flags = cur.take()?;
                let body_start = cur.pos;
                cur.pos = body_end;
                ns.children.insert(
                    name,
                    AcpiObj::Method {
                        block: 0, // stamped with the real block index after the parse
                        offset: body_start,
                        length: body_end - body_start,
                        arg_count: flags & 0x7,
                    },
                );
            }
            OP_EXT_PREFIX => {
                let ext = cur.take()?;
                match ext {
                    EXT_DEVICE | EXT_THERMAL_ZONE => {
                        let len_start = cur.pos;
                        let pkg = cur.pkg_length()?;
                        let scope_end = len_start + pkg;
                        let name = cur.name_string()?;
                        let mut child = Namespace::default();
                        parse_term_list(cur, scope_end, &mut child, mutexes)?;
                        let obj = if ext == EXT_DEVICE {
                            AcpiObj::Device(child)
                        } else {
                            AcpiObj::ThermalZone(child)
                        };
                        ns.children.insert(name, obj);
                    }
                    EXT_PROCESSOR => {
                        let len_start = cur.pos;
                        let pkg = cur.pkg_length()?;
                        let scope_end = len_start + pkg;
                        let name = cur.name_string()?;
                        let proc_id = cur.take()?;
                        let pblk = cur.take_n(4)?;
                        let pblk_addr = u32::from_le_bytes(pblk.try_into().unwrap());
                        let pblk_len = cur.take()?;
                        let mut child = Namespace::default();
                        parse_term_list(cur, scope_end, &mut child, mutexes)?;
                        ns.children.insert(
                            name,
                            AcpiObj::Processor {
                                proc_id,
                                pblk_addr,
                                pblk_len,
                                ns: child,
                            },
                        );
                    }
                    EXT_POWER_RES => {
                        let len_start = cur.pos;
                        let pkg = cur.pkg_length()?;
                        let scope_end = len_start + pkg;
                        let name = cur.name_string()?;
                        let system_level = cur.take()?;
                        let order = cur.take_n(2)?;
                        let resource_order = u16::from_le_bytes(order.try_into().unwrap());
                        let mut child = Namespace::default();
                        parse_term_list(cur, scope_end, &mut child, mutexes)?;
                        ns.children.insert(
                            name,
                            AcpiObj::PowerResource {
                                system_level,
                                resource_order,
                                ns: child,
                            },
                        );
                    }
                    EXT_OPREGION => {
                        let name = cur.name_string()?;
                        let space = cur.take()?;
                        let offset_val = cur
                            .data_object()?
                            .as_u64()
                            .ok_or(AmlError::TypeMismatch)?;
                        let length_val = cur
                            .data_object()?
                            .as_u64()
                            .ok_or(AmlError::TypeMismatch)?;
                        ns.children.insert(
                            name,
                            AcpiObj::OpRegion {
                                space,
                                offset: offset_val,
                                length: length_val,
                            },
                        );
                    }
                    EXT_FIELD => {
                        // Field lists carry layout, not values; record the
                        // region's presence and skip the list.
                        let len_start = cur.pos;
                        let pkg = cur.pkg_length()?;
                        let field_end = len_start + pkg;
                        let name = cur.name_string()?;
                        cur.pos = field_end;
                        ns.children.insert(name, AcpiObj::Field);
                    }
                    EXT_MUTEX => {
                        let name = cur.name_string()?;
                        let sync_level = cur.take()? & 0x0F;
                        mutexes.insert(name.clone(), Arc::new(Mutex::new(())));
                        ns.children.insert(name, AcpiObj::Mutex { sync_level });
                    }
                    EXT_EVENT => {
                        let name = cur.name_string()?;
                        ns.children.insert(name, AcpiObj::Event);
                    }
                    op => return Err(AmlError::UnknownOpcode { op, offset }),
                }
            }
            _ => {
                return Err(AmlError::UnknownOpcode { op, offset });
            }
        }
    }
    Ok(())
}

/// Recursively stamp Method objects with their definition block.
fn stamp_methods(ns: &mut Namespace, block_idx: usize) {
    for obj in ns.children.values_mut() {
        match obj {
            AcpiObj::Method { block, .. } => *block = block_idx,
            AcpiObj::Scope(child)
            | AcpiObj::Device(child)
            | AcpiObj::ThermalZone(child)
            | AcpiObj::PowerResource { ns: child, .. }
            | AcpiObj::Processor { ns: child, .. } => stamp_methods(child, block_idx),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s5_package() {
        // Name(_S5_, Package(2) { 0x05, 0x00 })
        let mut code = alloc::vec![OP_NAME];
        code.extend_from_slice(b"_S5_");
        code.push(OP_PACKAGE);
        code.push(6); // pkglength: itself + count + 2x2 bytes
        code.push(2); // elements
        code.push(OP_BYTE);
        code.push(0x05);
        code.push(OP_BYTE);
        code.push(0x00);

        let state = AmlState::parse(&code).unwrap();
        let data = state.evaluate("_S5_").unwrap();
        match data {
            AcpiData::Package(elements) => {
                assert_eq!(elements.len(), 2);
                assert_eq!(elements[0].as_u64(), Some(5));
            }
            other => panic!("expected package, got {:?}", other),
        }
    }

    #[test]
    fn unknown_opcode_is_rejected_not_skipped() {
        let code = [0xC8u8, 0x00, 0x00];
        let err = AmlState::parse(&code).unwrap_err();
        assert_eq!(
            err,
            AmlError::UnknownOpcode {
                op: 0xC8,
                offset: 0
            }
        );
    }

    #[test]
    fn scope_and_device_nesting() {
        // Scope(_SB_) { Device(COM0) { Name(_HID, 0x501) } }
        let mut inner = alloc::vec![OP_NAME];
        inner.extend_from_slice(b"_HID");
        inner.push(OP_WORD);
        inner.extend_from_slice(&0x501u16.to_le_bytes());

        let mut device = alloc::vec![OP_EXT_PREFIX, EXT_DEVICE];
        device.push((1 + 4 + inner.len()) as u8); // pkglength
        device.extend_from_slice(b"COM0");
        device.extend_from_slice(&inner);

        let mut code = alloc::vec![OP_SCOPE];
        code.push((1 + 4 + device.len()) as u8);
        code.extend_from_slice(b"_SB_");
        code.extend_from_slice(&device);

        let state = AmlState::parse(&code).unwrap();
        assert_eq!(state.system_bus_devices(), alloc::vec![String::from("COM0")]);
        let hid = state.get_obj("_HID").unwrap();
        match hid {
            AcpiObj::Name(data) => assert_eq!(data.as_u64(), Some(0x501)),
            other => panic!("expected name, got {:?}", other),
        }
    }

    #[test]
    fn method_with_return_executes() {
        // Method(_PTS, 1) { Return(One) }
        let mut code = alloc::vec![OP_METHOD];
        code.push(8); // pkglength: len byte + name(4) + flags + return + one
        code.extend_from_slice(b"_PTS");
        code.push(1); // one argument
        code.push(OP_RETURN);
        code.push(OP_ONE);

        let state = AmlState::parse(&code).unwrap();
        let obj = state.get_obj("_PTS").unwrap().clone();
        assert!(matches!(obj, AcpiObj::Method { arg_count: 1, .. }));
        assert_eq!(state.exec(&obj).unwrap(), AcpiData::One);
    }

    #[test]
    fn method_with_uncovered_body_reports_opcode() {
        // Method(BAD_, 0) { Store(...) } -- Store (0x70) is outside the
        // covered subset.
        let mut code = alloc::vec![OP_METHOD];
        code.push(7);
        code.extend_from_slice(b"BAD_");
        code.push(0);
        code.push(0x70);

        let state = AmlState::parse(&code).unwrap();
        let obj = state.get_obj("BAD_").unwrap().clone();
        assert!(matches!(
            state.exec(&obj),
            Err(AmlError::UnknownOpcode { op: 0x70, .. })
        ));
    }

    #[test]
    fn mutex_and_opregion() {
        // Mutex(LOCK, 0) ; OperationRegion(GPIO, SystemMemory, 0x4000, 8)
        let mut code = alloc::vec![OP_EXT_PREFIX, EXT_MUTEX];
        code.extend_from_slice(b"LOCK");
        code.push(0);
        code.push(OP_EXT_PREFIX);
        code.push(EXT_OPREGION);
        code.extend_from_slice(b"GPIO");
        code.push(0); // SystemMemory
        code.push(OP_DWORD);
        code.extend_from_slice(&0x4000u32.to_le_bytes());
        code.push(OP_BYTE);
        code.push(8);

        let state = AmlState::parse(&code).unwrap();
        assert!(state.mutex("LOCK").is_some());
        match state.get_obj("GPIO").unwrap() {
            AcpiObj::OpRegion {
                space,
                offset,
                length,
            } => {
                assert_eq!(*space, 0);
                assert_eq!(*offset, 0x4000);
                assert_eq!(*length, 8);
            }
            other => panic!("expected opregion, got {:?}", other),
        }
    }

    #[test]
    fn pkg_length_forms() {
        // One-byte form.
        let mut cur = Cursor::new(&[0x2A]);
        assert_eq!(cur.pkg_length().unwrap(), 0x2A);
        // Two-byte form: lead low nibble + next byte << 4.
        let mut cur = Cursor::new(&[0x48, 0x12]);
        assert_eq!(cur.pkg_length().unwrap(), 0x8 | (0x12 << 4));
    }

    #[test]
    fn string_and_buffer_values() {
        let mut code = alloc::vec![OP_NAME];
        code.extend_from_slice(b"STR_");
        code.push(OP_STRING);
        code.extend_from_slice(b"PNP0A03\0");
        let state = AmlState::parse(&code).unwrap();
        match state.get_obj("STR_").unwrap() {
            AcpiObj::Name(AcpiData::String(s)) => assert_eq!(s, "PNP0A03"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn truncated_stream_errors() {
        let code = [OP_NAME, b'_'];
        assert!(matches!(
            AmlState::parse(&code),
            Err(AmlError::Truncated { .. }) | Err(AmlError::BadName { .. })
        ));
    }
}
