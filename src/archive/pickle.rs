//! Restricted pickle interpreter for checkpoint object graphs
//!
//! Only the opcode subset emitted by `torch.save` is understood. Globals are
//! recorded as inert names and never resolved or called; the few
//! reconstructors checkpoints rely on (tensor rebuilds, ordered dicts,
//! parameter dicts) are interpreted structurally, everything else becomes an
//! opaque [`PickleValue::Object`].

use super::DType;
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Decoded, inert value of a pickled object graph.
#[derive(Debug, Clone, PartialEq)]
pub enum PickleValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<PickleValue>),
    List(Vec<PickleValue>),
    /// Insertion-ordered key/value pairs.
    Dict(Vec<(PickleValue, PickleValue)>),
    Global {
        module: String,
        name: String,
    },
    /// Persistent reference to a raw storage blob.
    Storage {
        dtype: DType,
        key: String,
    },
    Tensor(TensorRef),
    /// Result of an unrecognized reconstructor, kept for inspection only.
    Object {
        class: Box<PickleValue>,
        args: Box<PickleValue>,
        state: Option<Box<PickleValue>>,
    },
}

/// Tensor view over a storage blob, as rebuilt by `_rebuild_tensor_v2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRef {
    pub storage: String,
    pub dtype: DType,
    /// Offset into the storage, in elements.
    pub offset: usize,
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
}

impl TensorRef {
    /// Whether the strides describe a dense row-major layout.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1usize;
        for (&dim, &stride) in self.shape.iter().zip(&self.strides).rev() {
            if dim != 1 && stride != expected {
                return false;
            }
            expected *= dim;
        }
        true
    }
}

impl PickleValue {
    /// Look up a string key in a dict value.
    pub fn get(&self, key: &str) -> Option<&PickleValue> {
        match self {
            PickleValue::Dict(items) => items.iter().find_map(|(k, v)| match k {
                PickleValue::Str(s) if s == key => Some(v),
                _ => None,
            }),
            PickleValue::Object {
                state: Some(state), ..
            } => state.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PickleValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PickleValue::Int(v) => Some(*v),
            PickleValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    fn as_usize_list(&self) -> Option<Vec<usize>> {
        match self {
            PickleValue::Tuple(items) | PickleValue::List(items) => items
                .iter()
                .map(|v| v.as_int().and_then(|i| usize::try_from(i).ok()))
                .collect(),
            _ => None,
        }
    }

    fn is_global(&self, module: &str, name: &str) -> bool {
        matches!(self, PickleValue::Global { module: m, name: n } if m == module && n == name)
    }
}

/// Decoder turning a serialized object graph into inert values.
pub trait ObjectGraphDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PickleValue>;
}

/// Non-executing interpreter for the `torch.save` pickle subset.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestrictedUnpickler;

impl ObjectGraphDecoder for RestrictedUnpickler {
    fn decode(&self, bytes: &[u8]) -> Result<PickleValue> {
        Machine::new(bytes).run()
    }
}

pub(crate) mod op {
    pub const PROTO: u8 = 0x80;
    pub const FRAME: u8 = 0x95;
    pub const STOP: u8 = b'.';
    pub const MARK: u8 = b'(';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const NONE: u8 = b'N';
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const BINFLOAT: u8 = b'G';
    pub const BINUNICODE: u8 = b'X';
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_TUPLE: u8 = b')';
    pub const TUPLE: u8 = b't';
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const EMPTY_LIST: u8 = b']';
    pub const LIST: u8 = b'l';
    pub const APPEND: u8 = b'a';
    pub const APPENDS: u8 = b'e';
    pub const EMPTY_DICT: u8 = b'}';
    pub const DICT: u8 = b'd';
    pub const SETITEM: u8 = b's';
    pub const SETITEMS: u8 = b'u';
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const GLOBAL: u8 = b'c';
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const REDUCE: u8 = b'R';
    pub const BUILD: u8 = b'b';
    pub const NEWOBJ: u8 = 0x81;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const MEMOIZE: u8 = 0x94;
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const BINPERSID: u8 = b'Q';
}

struct Machine<'a> {
    bytes: &'a [u8],
    pos: usize,
    stack: Vec<PickleValue>,
    marks: Vec<usize>,
    memo: HashMap<u32, PickleValue>,
}

impl<'a> Machine<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn run(mut self) -> Result<PickleValue> {
        loop {
            let opcode = self.take_u8()?;
            match opcode {
                op::PROTO => {
                    self.take_u8()?;
                }
                op::FRAME => {
                    self.take(8)?;
                }
                op::STOP => return self.pop(),
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    self.pop()?;
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                op::NONE => self.stack.push(PickleValue::None),
                op::NEWTRUE => self.stack.push(PickleValue::Bool(true)),
                op::NEWFALSE => self.stack.push(PickleValue::Bool(false)),
                op::BININT => {
                    let v = i32::from_le_bytes(self.take_array()?);
                    self.stack.push(PickleValue::Int(i64::from(v)));
                }
                op::BININT1 => {
                    let v = self.take_u8()?;
                    self.stack.push(PickleValue::Int(i64::from(v)));
                }
                op::BININT2 => {
                    let v = u16::from_le_bytes(self.take_array()?);
                    self.stack.push(PickleValue::Int(i64::from(v)));
                }
                op::LONG1 => {
                    let n = usize::from(self.take_u8()?);
                    let v = self.take_long(n)?;
                    self.stack.push(PickleValue::Int(v));
                }
                op::LONG4 => {
                    let n = self.take_len32()?;
                    let v = self.take_long(n)?;
                    self.stack.push(PickleValue::Int(v));
                }
                op::BINFLOAT => {
                    let v = f64::from_be_bytes(self.take_array()?);
                    self.stack.push(PickleValue::Float(v));
                }
                op::BINUNICODE => {
                    let n = self.take_len32()?;
                    let s = self.take_string(n)?;
                    self.stack.push(PickleValue::Str(s));
                }
                op::SHORT_BINUNICODE => {
                    let n = usize::from(self.take_u8()?);
                    let s = self.take_string(n)?;
                    self.stack.push(PickleValue::Str(s));
                }
                op::BINUNICODE8 => {
                    let n = self.take_len64()?;
                    let s = self.take_string(n)?;
                    self.stack.push(PickleValue::Str(s));
                }
                op::BINSTRING => {
                    let n = self.take_len32()?;
                    let s = String::from_utf8_lossy(self.take(n)?).into_owned();
                    self.stack.push(PickleValue::Str(s));
                }
                op::SHORT_BINSTRING => {
                    let n = usize::from(self.take_u8()?);
                    let s = String::from_utf8_lossy(self.take(n)?).into_owned();
                    self.stack.push(PickleValue::Str(s));
                }
                op::BINBYTES => {
                    let n = self.take_len32()?;
                    let b = self.take(n)?.to_vec();
                    self.stack.push(PickleValue::Bytes(b));
                }
                op::SHORT_BINBYTES => {
                    let n = usize::from(self.take_u8()?);
                    let b = self.take(n)?.to_vec();
                    self.stack.push(PickleValue::Bytes(b));
                }
                op::BINBYTES8 => {
                    let n = self.take_len64()?;
                    let b = self.take(n)?.to_vec();
                    self.stack.push(PickleValue::Bytes(b));
                }
                op::EMPTY_TUPLE => self.stack.push(PickleValue::Tuple(Vec::new())),
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(PickleValue::Tuple(items));
                }
                op::TUPLE1 => {
                    let items = self.pop_n(1)?;
                    self.stack.push(PickleValue::Tuple(items));
                }
                op::TUPLE2 => {
                    let items = self.pop_n(2)?;
                    self.stack.push(PickleValue::Tuple(items));
                }
                op::TUPLE3 => {
                    let items = self.pop_n(3)?;
                    self.stack.push(PickleValue::Tuple(items));
                }
                op::EMPTY_LIST | op::EMPTY_SET => self.stack.push(PickleValue::List(Vec::new())),
                op::LIST | op::FROZENSET => {
                    let items = self.pop_mark()?;
                    self.stack.push(PickleValue::List(items));
                }
                op::APPEND => {
                    let item = self.pop()?;
                    self.extend_list(vec![item])?;
                }
                op::APPENDS | op::ADDITEMS => {
                    let items = self.pop_mark()?;
                    self.extend_list(items)?;
                }
                op::EMPTY_DICT => self.stack.push(PickleValue::Dict(Vec::new())),
                op::DICT => {
                    let items = self.pop_mark()?;
                    let pairs = pair_up(items)?;
                    self.stack.push(PickleValue::Dict(pairs));
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.extend_dict(vec![(key, value)])?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = pair_up(items)?;
                    self.extend_dict(pairs)?;
                }
                op::GLOBAL => {
                    let module = self.take_line()?;
                    let name = self.take_line()?;
                    self.stack.push(PickleValue::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (PickleValue::Str(module), PickleValue::Str(name)) => {
                            self.stack.push(PickleValue::Global { module, name });
                        }
                        _ => return Err(Error::Pickle("STACK_GLOBAL expects strings".into())),
                    }
                }
                op::REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let value = reduce(callable, args)?;
                    self.stack.push(value);
                }
                op::NEWOBJ => {
                    let args = self.pop()?;
                    let class = self.pop()?;
                    let value = reduce(class, args)?;
                    self.stack.push(value);
                }
                op::NEWOBJ_EX => {
                    let _kwargs = self.pop()?;
                    let args = self.pop()?;
                    let class = self.pop()?;
                    let value = reduce(class, args)?;
                    self.stack.push(value);
                }
                op::BUILD => {
                    let state = self.pop()?;
                    let target = self.pop()?;
                    self.stack.push(build(target, state));
                }
                op::BINPUT => {
                    let idx = u32::from(self.take_u8()?);
                    self.memoize(idx)?;
                }
                op::LONG_BINPUT => {
                    let idx = u32::from_le_bytes(self.take_array()?);
                    self.memoize(idx)?;
                }
                op::MEMOIZE => {
                    let idx = self.memo.len() as u32;
                    self.memoize(idx)?;
                }
                op::BINGET => {
                    let idx = u32::from(self.take_u8()?);
                    self.recall(idx)?;
                }
                op::LONG_BINGET => {
                    let idx = u32::from_le_bytes(self.take_array()?);
                    self.recall(idx)?;
                }
                op::BINPERSID => {
                    let pid = self.pop()?;
                    let storage = persistent_load(pid)?;
                    self.stack.push(storage);
                }
                other => {
                    return Err(Error::Pickle(format!(
                        "unsupported opcode 0x{other:02x} at byte {}",
                        self.pos - 1
                    )))
                }
            }
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| Error::Pickle("unexpected end of stream".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn take_len32(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.take_array()?) as usize)
    }

    fn take_len64(&mut self) -> Result<usize> {
        usize::try_from(u64::from_le_bytes(self.take_array()?))
            .map_err(|_| Error::Pickle("length overflow".into()))
    }

    fn take_long(&mut self, n: usize) -> Result<i64> {
        if n > 8 {
            return Err(Error::Pickle(format!("integer of {n} bytes too large")));
        }
        let bytes = self.take(n)?;
        if n == 0 {
            return Ok(0);
        }
        let negative = bytes[n - 1] & 0x80 != 0;
        let mut buf = if negative { [0xffu8; 8] } else { [0u8; 8] };
        buf[..n].copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    fn take_string(&mut self, n: usize) -> Result<String> {
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Pickle(e.to_string()))
    }

    fn take_line(&mut self) -> Result<String> {
        let rest = &self.bytes[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::Pickle("unterminated GLOBAL".into()))?;
        let line = self.take_string(len)?;
        self.pos += 1;
        Ok(line)
    }

    fn pop(&mut self) -> Result<PickleValue> {
        self.stack
            .pop()
            .ok_or_else(|| Error::Pickle("stack underflow".into()))
    }

    fn top(&self) -> Result<&PickleValue> {
        self.stack
            .last()
            .ok_or_else(|| Error::Pickle("stack underflow".into()))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<PickleValue>> {
        if self.stack.len() < n {
            return Err(Error::Pickle("stack underflow".into()));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn pop_mark(&mut self) -> Result<Vec<PickleValue>> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| Error::Pickle("missing MARK".into()))?;
        if mark > self.stack.len() {
            return Err(Error::Pickle("MARK beyond stack".into()));
        }
        Ok(self.stack.split_off(mark))
    }

    fn extend_list(&mut self, items: Vec<PickleValue>) -> Result<()> {
        match self.stack.last_mut() {
            Some(PickleValue::List(list)) => {
                list.extend(items);
                Ok(())
            }
            _ => Err(Error::Pickle("APPEND target is not a list".into())),
        }
    }

    fn extend_dict(&mut self, pairs: Vec<(PickleValue, PickleValue)>) -> Result<()> {
        match self.stack.last_mut() {
            Some(PickleValue::Dict(dict)) => {
                dict.extend(pairs);
                Ok(())
            }
            _ => Err(Error::Pickle("SETITEM target is not a dict".into())),
        }
    }

    fn memoize(&mut self, idx: u32) -> Result<()> {
        let top = self.top()?.clone();
        self.memo.insert(idx, top);
        Ok(())
    }

    fn recall(&mut self, idx: u32) -> Result<()> {
        let value = self
            .memo
            .get(&idx)
            .cloned()
            .ok_or_else(|| Error::Pickle(format!("memo entry {idx} missing")))?;
        self.stack.push(value);
        Ok(())
    }
}

fn pair_up(items: Vec<PickleValue>) -> Result<Vec<(PickleValue, PickleValue)>> {
    if items.len() % 2 != 0 {
        return Err(Error::Pickle("odd number of dict items".into()));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        pairs.push((k, v));
    }
    Ok(pairs)
}

fn storage_dtype(name: &str) -> Option<DType> {
    match name {
        "HalfStorage" => Some(DType::F16),
        "BFloat16Storage" => Some(DType::BF16),
        "FloatStorage" => Some(DType::F32),
        "DoubleStorage" => Some(DType::F64),
        _ => None,
    }
}

/// Resolve `('storage', StorageClass, key, location, size)` ids.
fn persistent_load(pid: PickleValue) -> Result<PickleValue> {
    let PickleValue::Tuple(items) = pid else {
        return Err(Error::Pickle("persistent id is not a tuple".into()));
    };
    match items.as_slice() {
        [PickleValue::Str(tag), PickleValue::Global { name, .. }, PickleValue::Str(key), ..]
            if tag == "storage" =>
        {
            let dtype = storage_dtype(name)
                .ok_or_else(|| Error::Pickle(format!("unsupported storage type {name}")))?;
            Ok(PickleValue::Storage {
                dtype,
                key: key.clone(),
            })
        }
        _ => Err(Error::Pickle("unrecognized persistent id".into())),
    }
}

fn is_empty_dict_class(class: &PickleValue) -> bool {
    class.is_global("collections", "OrderedDict")
        || class.is_global("torch.nn.modules.container", "ParameterDict")
        || class.is_global("builtins", "dict")
}

fn opaque(class: PickleValue, args: PickleValue) -> PickleValue {
    PickleValue::Object {
        class: Box::new(class),
        args: Box::new(args),
        state: None,
    }
}

fn reduce(callable: PickleValue, args: PickleValue) -> Result<PickleValue> {
    let (module, name) = match &callable {
        PickleValue::Global { module, name } => (module.clone(), name.clone()),
        _ => return Ok(opaque(callable, args)),
    };
    match (module.as_str(), name.as_str()) {
        ("torch._utils", "_rebuild_tensor_v2" | "_rebuild_tensor") => rebuild_tensor(args),
        ("torch._utils", "_rebuild_parameter" | "_rebuild_parameter_with_state") => {
            match args {
                PickleValue::Tuple(mut items) if !items.is_empty() => Ok(items.swap_remove(0)),
                _ => Err(Error::Pickle("_rebuild_parameter without tensor".into())),
            }
        }
        ("copyreg", "_reconstructor") => match &args {
            PickleValue::Tuple(items) if items.first().is_some_and(is_empty_dict_class) => {
                Ok(PickleValue::Dict(Vec::new()))
            }
            _ => Ok(opaque(callable, args)),
        },
        _ if is_empty_dict_class(&callable) => Ok(PickleValue::Dict(Vec::new())),
        _ => Ok(opaque(callable, args)),
    }
}

fn rebuild_tensor(args: PickleValue) -> Result<PickleValue> {
    let PickleValue::Tuple(items) = args else {
        return Err(Error::Pickle("tensor rebuild args are not a tuple".into()));
    };
    let (Some(PickleValue::Storage { dtype, key }), Some(offset), Some(shape), Some(strides)) = (
        items.first(),
        items.get(1).and_then(PickleValue::as_int),
        items.get(2).and_then(PickleValue::as_usize_list),
        items.get(3).and_then(PickleValue::as_usize_list),
    ) else {
        return Err(Error::Pickle("malformed tensor rebuild args".into()));
    };
    let offset =
        usize::try_from(offset).map_err(|_| Error::Pickle("negative storage offset".into()))?;
    Ok(PickleValue::Tensor(TensorRef {
        storage: key.clone(),
        dtype: *dtype,
        offset,
        shape,
        strides,
    }))
}

fn build(target: PickleValue, state: PickleValue) -> PickleValue {
    match (target, state) {
        (PickleValue::Dict(mut items), PickleValue::Dict(extra)) => {
            items.extend(extra);
            PickleValue::Dict(items)
        }
        (PickleValue::Object { class, args, .. }, state) => PickleValue::Object {
            class,
            args,
            state: Some(Box::new(state)),
        },
        (target, _) => target,
    }
}
