//! Just enough of the pickle format to read the CIFAR-10 Python shards.
//!
//! Objects the unpickler would build by calling into Python (numpy arrays, dtypes) are kept
//! as [`Object::Reduce`] / [`Object::Build`] trees and interpreted by the caller.
use std::collections::HashMap;
use std::io::{BufRead, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::error::PickleError;

type Result<T> = std::result::Result<T, PickleError>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpCode {
    Proto = 0x80,
    Frame = 0x95,
    Stop = b'.',
    Mark = b'(',
    Pop = b'0',
    PopMark = b'1',
    Dup = b'2',
    None = b'N',
    NewTrue = 0x88,
    NewFalse = 0x89,
    Int = b'I',
    Long = b'L',
    BinInt = b'J',
    BinInt1 = b'K',
    BinInt2 = b'M',
    Long1 = 0x8a,
    BinFloat = b'G',
    ShortBinString = b'U',
    BinString = b'T',
    ShortBinBytes = b'C',
    BinBytes = b'B',
    BinBytes8 = 0x8e,
    ByteArray8 = 0x96,
    ShortBinUnicode = 0x8c,
    BinUnicode = b'X',
    BinUnicode8 = 0x8d,
    EmptyList = b']',
    List = b'l',
    Append = b'a',
    Appends = b'e',
    EmptyTuple = b')',
    Tuple = b't',
    Tuple1 = 0x85,
    Tuple2 = 0x86,
    Tuple3 = 0x87,
    EmptyDict = b'}',
    Dict = b'd',
    SetItem = b's',
    SetItems = b'u',
    Global = b'c',
    StackGlobal = 0x93,
    Reduce = b'R',
    NewObj = 0x81,
    Build = b'b',
    Put = b'p',
    BinPut = b'q',
    LongBinPut = b'r',
    Memoize = 0x94,
    Get = b'g',
    BinGet = b'h',
    LongBinGet = b'j',
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        let op = match value {
            0x80 => Self::Proto,
            0x95 => Self::Frame,
            b'.' => Self::Stop,
            b'(' => Self::Mark,
            b'0' => Self::Pop,
            b'1' => Self::PopMark,
            b'2' => Self::Dup,
            b'N' => Self::None,
            0x88 => Self::NewTrue,
            0x89 => Self::NewFalse,
            b'I' => Self::Int,
            b'L' => Self::Long,
            b'J' => Self::BinInt,
            b'K' => Self::BinInt1,
            b'M' => Self::BinInt2,
            0x8a => Self::Long1,
            b'G' => Self::BinFloat,
            b'U' => Self::ShortBinString,
            b'T' => Self::BinString,
            b'C' => Self::ShortBinBytes,
            b'B' => Self::BinBytes,
            0x8e => Self::BinBytes8,
            0x96 => Self::ByteArray8,
            0x8c => Self::ShortBinUnicode,
            b'X' => Self::BinUnicode,
            0x8d => Self::BinUnicode8,
            b']' => Self::EmptyList,
            b'l' => Self::List,
            b'a' => Self::Append,
            b'e' => Self::Appends,
            b')' => Self::EmptyTuple,
            b't' => Self::Tuple,
            0x85 => Self::Tuple1,
            0x86 => Self::Tuple2,
            0x87 => Self::Tuple3,
            b'}' => Self::EmptyDict,
            b'd' => Self::Dict,
            b's' => Self::SetItem,
            b'u' => Self::SetItems,
            b'c' => Self::Global,
            0x93 => Self::StackGlobal,
            b'R' => Self::Reduce,
            0x81 => Self::NewObj,
            b'b' => Self::Build,
            b'p' => Self::Put,
            b'q' => Self::BinPut,
            b'r' => Self::LongBinPut,
            0x94 => Self::Memoize,
            b'g' => Self::Get,
            b'h' => Self::BinGet,
            b'j' => Self::LongBinGet,
            value => return Err(value),
        };
        Ok(op)
    }
}

/// A decoded pickle value.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Python 2 `str`, Python 3 `bytes` and `bytearray`.
    Bytes(Vec<u8>),
    String(String),
    List(Vec<Object>),
    Tuple(Vec<Object>),
    /// Entries in insertion order.
    Dict(Vec<(Object, Object)>),
    Class {
        module: String,
        name: String,
    },
    Reduce {
        callable: Box<Object>,
        args: Box<Object>,
    },
    Build {
        callable: Box<Object>,
        args: Box<Object>,
    },
}

impl Object {
    /// Looks up `key` in a dict whose keys are either text or byte strings.
    pub fn get(&self, key: &str) -> Option<&Object> {
        let Object::Dict(entries) = self else {
            return None;
        };

        entries
            .iter()
            .find(|(k, _)| k.as_text().as_deref() == Some(key))
            .map(|(_, value)| value)
    }

    /// Text of a `String`, or of a `Bytes` value read as latin-1.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Object::String(s) => Some(s.clone()),
            Object::Bytes(bytes) => Some(bytes.iter().map(|&b| b as char).collect()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Object::Int(value) => Some(*value),
            Object::Bool(value) => Some(*value as i64),
            _ => None,
        }
    }

    /// Whether this is the global `name`, whatever module it was imported from.
    pub fn is_class(&self, class_name: &str) -> bool {
        matches!(self, Object::Class { name, .. } if name == class_name)
    }

    /// Whether this is `class_name(...)`.
    pub fn is_reduce_of(&self, class_name: &str) -> bool {
        matches!(self, Object::Reduce { callable, .. } if callable.is_class(class_name))
    }
}

#[derive(Default)]
struct Stack {
    stack: Vec<Object>,
    marks: Vec<usize>,
    memo: HashMap<u32, Object>,
}

impl Stack {
    fn push(&mut self, object: Object) {
        self.stack.push(object);
    }

    fn pop(&mut self) -> Result<Object> {
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn last_mut(&mut self) -> Result<&mut Object> {
        self.stack.last_mut().ok_or(PickleError::StackUnderflow)
    }

    fn push_mark(&mut self) {
        self.marks.push(self.stack.len());
    }

    fn pop_to_mark(&mut self) -> Result<Vec<Object>> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| PickleError::InvalidData("mark not found".to_string()))?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow);
        }
        Ok(self.stack.split_off(mark))
    }

    fn memo_put(&mut self, index: u32) -> Result<()> {
        let top = self.stack.last().ok_or(PickleError::StackUnderflow)?;
        self.memo.insert(index, top.clone());
        Ok(())
    }

    fn memo_get(&mut self, index: u32) -> Result<()> {
        let object = self
            .memo
            .get(&index)
            .cloned()
            .ok_or(PickleError::MemoNotFound(index))?;
        self.push(object);
        Ok(())
    }

    fn append(&mut self, items: Vec<Object>) -> Result<()> {
        match self.last_mut()? {
            Object::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => Err(PickleError::InvalidData(format!(
                "cannot append to {}",
                kind(other)
            ))),
        }
    }

    fn set_items(&mut self, items: Vec<Object>) -> Result<()> {
        if items.len() % 2 != 0 {
            return Err(PickleError::InvalidData(
                "odd number of dict items".to_string(),
            ));
        }

        match self.last_mut()? {
            Object::Dict(entries) => {
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    entries.push((key, value));
                }
                Ok(())
            }
            other => Err(PickleError::InvalidData(format!(
                "cannot set items on {}",
                kind(other)
            ))),
        }
    }
}

fn kind(object: &Object) -> &'static str {
    match object {
        Object::None => "None",
        Object::Bool(_) => "bool",
        Object::Int(_) => "int",
        Object::Float(_) => "float",
        Object::Bytes(_) => "bytes",
        Object::String(_) => "str",
        Object::List(_) => "list",
        Object::Tuple(_) => "tuple",
        Object::Dict(_) => "dict",
        Object::Class { .. } => "global",
        Object::Reduce { .. } => "reduce",
        Object::Build { .. } => "build",
    }
}

fn read_line<R: BufRead>(r: &mut R) -> Result<String> {
    let mut line = Vec::with_capacity(32);
    r.read_until(b'\n', &mut line)?;
    if line.pop() != Some(b'\n') {
        return Err(PickleError::InvalidData("unterminated line".to_string()));
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|err| PickleError::InvalidData(err.to_string()))
}

/// Reads exactly `len` bytes without trusting `len` for the allocation.
fn read_bytes<R: Read>(r: &mut R, len: u64) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    r.take(len).read_to_end(&mut data)?;
    if (data.len() as u64) < len {
        return Err(PickleError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(data)
}

fn read_utf8<R: Read>(r: &mut R, len: u64) -> Result<Object> {
    let data = read_bytes(r, len)?;
    String::from_utf8(data)
        .map(Object::String)
        .map_err(|err| PickleError::InvalidData(err.to_string()))
}

/// Little-endian two's complement, as written by `LONG1`.
fn decode_long(data: &[u8]) -> Result<i64> {
    if data.len() > 8 {
        return Err(PickleError::InvalidData(format!(
            "{}-byte integer does not fit in 64 bits",
            data.len()
        )));
    }

    let mut value = 0i64;
    for (i, &byte) in data.iter().enumerate() {
        value |= (byte as i64) << (8 * i);
    }
    if let Some(&last) = data.last() {
        if last & 0x80 != 0 && data.len() < 8 {
            value -= 1i64 << (8 * data.len());
        }
    }
    Ok(value)
}

fn parse_int(line: &str) -> Result<Object> {
    match line {
        "00" => Ok(Object::Bool(false)),
        "01" => Ok(Object::Bool(true)),
        _ => line
            .trim_end_matches('L')
            .parse::<i64>()
            .map(Object::Int)
            .map_err(|err| PickleError::InvalidData(format!("invalid integer '{line}': {err}"))),
    }
}

fn parse_memo_index(line: &str) -> Result<u32> {
    line.parse()
        .map_err(|err| PickleError::InvalidData(format!("invalid memo index '{line}': {err}")))
}

/// Decodes one pickled object, stopping at its `STOP` opcode.
pub fn read_pickle<R: BufRead>(r: &mut R) -> Result<Object> {
    let mut stack = Stack::default();

    loop {
        let op_code = r.read_u8()?;
        let op_code = OpCode::try_from(op_code).map_err(PickleError::InvalidOpCode)?;

        match op_code {
            OpCode::Proto => {
                let version = r.read_u8()?;
                if version > 5 {
                    return Err(PickleError::InvalidProtocol(version));
                }
            }
            OpCode::Frame => {
                r.read_u64::<LittleEndian>()?;
            }
            OpCode::Stop => return stack.pop(),
            OpCode::Mark => stack.push_mark(),
            OpCode::Pop => {
                stack.pop()?;
            }
            OpCode::PopMark => {
                stack.pop_to_mark()?;
            }
            OpCode::Dup => {
                let top = stack.stack.last().cloned().ok_or(PickleError::StackUnderflow)?;
                stack.push(top);
            }
            OpCode::None => stack.push(Object::None),
            OpCode::NewTrue => stack.push(Object::Bool(true)),
            OpCode::NewFalse => stack.push(Object::Bool(false)),
            OpCode::Int | OpCode::Long => {
                let line = read_line(r)?;
                stack.push(parse_int(&line)?);
            }
            OpCode::BinInt => stack.push(Object::Int(r.read_i32::<LittleEndian>()? as i64)),
            OpCode::BinInt1 => stack.push(Object::Int(r.read_u8()? as i64)),
            OpCode::BinInt2 => stack.push(Object::Int(r.read_u16::<LittleEndian>()? as i64)),
            OpCode::Long1 => {
                let len = r.read_u8()?;
                let data = read_bytes(r, len as u64)?;
                stack.push(Object::Int(decode_long(&data)?));
            }
            OpCode::BinFloat => stack.push(Object::Float(r.read_f64::<BigEndian>()?)),
            OpCode::ShortBinString | OpCode::ShortBinBytes => {
                let len = r.read_u8()?;
                stack.push(Object::Bytes(read_bytes(r, len as u64)?));
            }
            OpCode::BinString => {
                let len = r.read_i32::<LittleEndian>()?;
                let len = u64::try_from(len).map_err(|_| {
                    PickleError::InvalidData(format!("negative string length {len}"))
                })?;
                stack.push(Object::Bytes(read_bytes(r, len)?));
            }
            OpCode::BinBytes => {
                let len = r.read_u32::<LittleEndian>()?;
                stack.push(Object::Bytes(read_bytes(r, len as u64)?));
            }
            OpCode::BinBytes8 | OpCode::ByteArray8 => {
                let len = r.read_u64::<LittleEndian>()?;
                stack.push(Object::Bytes(read_bytes(r, len)?));
            }
            OpCode::ShortBinUnicode => {
                let len = r.read_u8()?;
                stack.push(read_utf8(r, len as u64)?);
            }
            OpCode::BinUnicode => {
                let len = r.read_u32::<LittleEndian>()?;
                stack.push(read_utf8(r, len as u64)?);
            }
            OpCode::BinUnicode8 => {
                let len = r.read_u64::<LittleEndian>()?;
                stack.push(read_utf8(r, len)?);
            }
            OpCode::EmptyList => stack.push(Object::List(Vec::new())),
            OpCode::List => {
                let items = stack.pop_to_mark()?;
                stack.push(Object::List(items));
            }
            OpCode::Append => {
                let item = stack.pop()?;
                stack.append(vec![item])?;
            }
            OpCode::Appends => {
                let items = stack.pop_to_mark()?;
                stack.append(items)?;
            }
            OpCode::EmptyTuple => stack.push(Object::Tuple(Vec::new())),
            OpCode::Tuple => {
                let items = stack.pop_to_mark()?;
                stack.push(Object::Tuple(items));
            }
            OpCode::Tuple1 | OpCode::Tuple2 | OpCode::Tuple3 => {
                let len = match op_code {
                    OpCode::Tuple1 => 1,
                    OpCode::Tuple2 => 2,
                    _ => 3,
                };
                if stack.stack.len() < len {
                    return Err(PickleError::StackUnderflow);
                }
                let at = stack.stack.len() - len;
                let items = stack.stack.split_off(at);
                stack.push(Object::Tuple(items));
            }
            OpCode::EmptyDict => stack.push(Object::Dict(Vec::new())),
            OpCode::Dict => {
                let items = stack.pop_to_mark()?;
                stack.push(Object::Dict(Vec::new()));
                stack.set_items(items)?;
            }
            OpCode::SetItem => {
                let value = stack.pop()?;
                let key = stack.pop()?;
                stack.set_items(vec![key, value])?;
            }
            OpCode::SetItems => {
                let items = stack.pop_to_mark()?;
                stack.set_items(items)?;
            }
            OpCode::Global => {
                let module = read_line(r)?;
                let name = read_line(r)?;
                stack.push(Object::Class { module, name });
            }
            OpCode::StackGlobal => {
                let name = stack.pop()?;
                let module = stack.pop()?;
                match (module, name) {
                    (Object::String(module), Object::String(name)) => {
                        stack.push(Object::Class { module, name })
                    }
                    _ => {
                        return Err(PickleError::InvalidData(
                            "STACK_GLOBAL expects two strings".to_string(),
                        ))
                    }
                }
            }
            OpCode::Reduce | OpCode::NewObj => {
                let args = stack.pop()?;
                let callable = stack.pop()?;
                stack.push(Object::Reduce {
                    callable: Box::new(callable),
                    args: Box::new(args),
                });
            }
            OpCode::Build => {
                let args = stack.pop()?;
                let callable = stack.pop()?;
                stack.push(Object::Build {
                    callable: Box::new(callable),
                    args: Box::new(args),
                });
            }
            OpCode::Put => {
                let index = parse_memo_index(&read_line(r)?)?;
                stack.memo_put(index)?;
            }
            OpCode::BinPut => {
                let index = r.read_u8()? as u32;
                stack.memo_put(index)?;
            }
            OpCode::LongBinPut => {
                let index = r.read_u32::<LittleEndian>()?;
                stack.memo_put(index)?;
            }
            OpCode::Memoize => {
                let index = stack.memo.len() as u32;
                stack.memo_put(index)?;
            }
            OpCode::Get => {
                let index = parse_memo_index(&read_line(r)?)?;
                stack.memo_get(index)?;
            }
            OpCode::BinGet => {
                let index = r.read_u8()? as u32;
                stack.memo_get(index)?;
            }
            OpCode::LongBinGet => {
                let index = r.read_u32::<LittleEndian>()?;
                stack.memo_get(index)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(bytes: &[u8]) -> Result<Object> {
        read_pickle(&mut &bytes[..])
    }

    #[test]
    fn reads_integers_of_every_width() {
        // [1, 300, -2, 70000, -129]
        let bytes = b"\x80\x02](K\x01M\x2c\x01J\xfe\xff\xff\xffJ\x70\x11\x01\x00\x8a\x02\x7f\xffe.";

        let object = read(bytes).unwrap();

        assert_eq!(
            object,
            Object::List(vec![
                Object::Int(1),
                Object::Int(300),
                Object::Int(-2),
                Object::Int(70000),
                Object::Int(-129),
            ])
        );
    }

    #[test]
    fn memo_references_resolve_to_earlier_objects() {
        // ('ab', 'ab') with the second element fetched from the memo.
        let bytes = b"\x80\x02U\x02abq\x01h\x01\x86.";

        let object = read(bytes).unwrap();

        assert_eq!(
            object,
            Object::Tuple(vec![Object::Bytes(b"ab".to_vec()), Object::Bytes(b"ab".to_vec())])
        );
    }

    #[test]
    fn dict_keys_match_text_and_byte_strings() {
        // {'data': True, u'labels': None} built with nested marks.
        let bytes = b"\x80\x02}(U\x04data\x88X\x06\x00\x00\x00labelsN(K\x01t0u.";

        let object = read(bytes).unwrap();

        assert_eq!(object.get("data"), Some(&Object::Bool(true)));
        assert_eq!(object.get("labels"), Some(&Object::None));
        assert_eq!(object.get("missing"), None);
    }

    #[test]
    fn reduce_and_build_are_kept_as_trees() {
        let bytes = b"\x80\x02cnumpy\ndtype\nU\x02u1\x85R}b.";

        let object = read(bytes).unwrap();

        let Object::Build { callable, args } = object else {
            panic!("expected a build node");
        };
        assert!(callable.is_reduce_of("dtype"));
        assert_eq!(*args, Object::Dict(Vec::new()));
    }

    #[test]
    fn protocol_zero_integers_and_booleans() {
        let bytes = b"(I42\nI01\nL-7L\nl.";

        let object = read(bytes).unwrap();

        assert_eq!(
            object,
            Object::List(vec![Object::Int(42), Object::Bool(true), Object::Int(-7)])
        );
    }

    #[test]
    fn truncated_input_is_an_io_error() {
        let err = read(b"\x80\x02T\x10\x00\x00\x00abc").unwrap_err();

        assert!(matches!(err, PickleError::Io(_)));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let err = read(b"\x80\x02\xff.").unwrap_err();

        assert!(matches!(err, PickleError::InvalidOpCode(0xff)));
    }

    #[test]
    fn popping_an_empty_stack_fails() {
        let err = read(b"\x80\x02.").unwrap_err();

        assert!(matches!(err, PickleError::StackUnderflow));
    }
}
