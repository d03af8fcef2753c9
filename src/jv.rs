//! Owned handles to libjq's JSON values.
//!
//! libjq reference-counts its values and most functions consume the
//! reference they are handed. [`Jv`] owns exactly one reference: cloning
//! calls `jv_copy`, dropping calls `jv_free`, and the methods below copy
//! before calling into functions that consume.

use std::fmt;
use std::ops::BitOr;
use std::os::raw::c_int;
use std::slice;

use crate::error::{JqError, Result};
use crate::ffi::{self, JqLib};

/// The kind of value a [`Jv`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JvKind {
    Invalid,
    Null,
    False,
    True,
    Number,
    String,
    Array,
    Object,
}

impl From<ffi::jv_kind> for JvKind {
    fn from(kind: ffi::jv_kind) -> Self {
        match kind {
            ffi::JV_KIND_NULL => JvKind::Null,
            ffi::JV_KIND_FALSE => JvKind::False,
            ffi::JV_KIND_TRUE => JvKind::True,
            ffi::JV_KIND_NUMBER => JvKind::Number,
            ffi::JV_KIND_STRING => JvKind::String,
            ffi::JV_KIND_ARRAY => JvKind::Array,
            ffi::JV_KIND_OBJECT => JvKind::Object,
            _ => JvKind::Invalid,
        }
    }
}

impl fmt::Display for JvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JvKind::Invalid => "<invalid>",
            JvKind::Null => "null",
            JvKind::False | JvKind::True => "boolean",
            JvKind::Number => "number",
            JvKind::String => "string",
            JvKind::Array => "array",
            JvKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// Flags accepted by [`Jv::dump`], mirroring `JV_PRINT_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrintFlags(c_int);

impl PrintFlags {
    pub const NONE: PrintFlags = PrintFlags(0);
    /// Print across multiple lines
    pub const PRETTY: PrintFlags = PrintFlags(1);
    /// Escape non-ASCII characters
    pub const ASCII: PrintFlags = PrintFlags(2);
    /// ANSI colour escapes by value kind
    pub const COLOUR: PrintFlags = PrintFlags(4);
    /// Sort object keys
    pub const SORTED: PrintFlags = PrintFlags(8);
    /// Print invalid values as `<invalid>` instead of asserting
    pub const INVALID: PrintFlags = PrintFlags(16);
    pub const REFCOUNT: PrintFlags = PrintFlags(32);
    pub const TAB: PrintFlags = PrintFlags(64);
    pub const ISATTY: PrintFlags = PrintFlags(128);
    pub const SPACE0: PrintFlags = PrintFlags(256);
    pub const SPACE1: PrintFlags = PrintFlags(512);
    pub const SPACE2: PrintFlags = PrintFlags(1024);

    pub fn bits(self) -> c_int {
        self.0
    }

    pub fn contains(self, other: PrintFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PrintFlags {
    type Output = PrintFlags;

    fn bitor(self, rhs: PrintFlags) -> PrintFlags {
        PrintFlags(self.0 | rhs.0)
    }
}

/// One owned reference to a libjq value.
pub struct Jv {
    lib: &'static JqLib,
    raw: ffi::jv,
}

impl Jv {
    /// Wraps a raw value, taking over its reference.
    ///
    /// # Safety
    ///
    /// `raw` must be a live value produced by `lib` that the caller owns.
    pub unsafe fn from_raw(lib: &'static JqLib, raw: ffi::jv) -> Self {
        Jv { lib, raw }
    }

    /// Releases ownership of the reference without freeing it.
    pub fn into_raw(self) -> ffi::jv {
        let raw = self.raw;
        std::mem::forget(self);
        raw
    }

    /// Borrows the raw value. The reference stays owned by `self`.
    pub fn as_raw(&self) -> ffi::jv {
        self.raw
    }

    pub fn library(&self) -> &'static JqLib {
        self.lib
    }

    pub fn null(lib: &'static JqLib) -> Self {
        unsafe { Jv::from_raw(lib, (lib.jv_null)()) }
    }

    pub fn kind(&self) -> JvKind {
        JvKind::from(unsafe { (self.lib.jv_get_kind)(self.raw) })
    }

    /// Returns false for invalid values, which carry errors.
    ///
    /// `jv_is_valid` is an inline in jv.h and not exported, so this checks
    /// the kind instead.
    pub fn is_valid(&self) -> bool {
        unsafe { (self.lib.jv_get_kind)(self.raw) != ffi::JV_KIND_INVALID }
    }

    /// Parses JSON text with libjq's parser.
    pub fn parse(lib: &'static JqLib, text: &str) -> Result<Self> {
        let len = text_len(text)?;
        let parsed = unsafe { Jv::from_raw(lib, (lib.jv_parse_sized)(text.as_ptr().cast(), len)) };
        if parsed.is_valid() {
            Ok(parsed)
        } else {
            let msg = parsed
                .invalid_message()
                .unwrap_or_else(|| "unparseable input".to_string());
            Err(JqError::InvalidJson(msg))
        }
    }

    /// Builds a libjq value from a serde value.
    pub fn from_value(lib: &'static JqLib, value: &serde_json::Value) -> Result<Self> {
        use serde_json::Value;

        let jv = match value {
            Value::Null => Jv::null(lib),
            Value::Bool(b) => unsafe { Jv::from_raw(lib, (lib.jv_bool)(c_int::from(*b))) },
            Value::Number(n) => {
                let n = n.as_f64().ok_or_else(|| {
                    JqError::WrongType(format!("number {} is not representable", n))
                })?;
                unsafe { Jv::from_raw(lib, (lib.jv_number)(n)) }
            }
            Value::String(s) => Jv::string(lib, s)?,
            Value::Array(items) => {
                let mut array = unsafe { Jv::from_raw(lib, (lib.jv_array)()) };
                for item in items {
                    let item = Jv::from_value(lib, item)?;
                    array = unsafe {
                        Jv::from_raw(lib, (lib.jv_array_append)(array.into_raw(), item.into_raw()))
                    };
                }
                array
            }
            Value::Object(map) => {
                let mut object = unsafe { Jv::from_raw(lib, (lib.jv_object)()) };
                for (key, item) in map {
                    let key = Jv::string(lib, key)?;
                    let item = Jv::from_value(lib, item)?;
                    object = unsafe {
                        Jv::from_raw(
                            lib,
                            (lib.jv_object_set)(object.into_raw(), key.into_raw(), item.into_raw()),
                        )
                    };
                }
                object
            }
        };
        Ok(jv)
    }

    pub fn string(lib: &'static JqLib, s: &str) -> Result<Self> {
        let len = text_len(s)?;
        Ok(unsafe { Jv::from_raw(lib, (lib.jv_string_sized)(s.as_ptr().cast(), len)) })
    }

    /// Converts to the closest serde value.
    ///
    /// Integral numbers become `i64`, other numbers `f64`; NaN and the
    /// infinities become null, as jq prints them.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        use serde_json::Value;

        let lib = self.lib;
        let value = match self.kind() {
            JvKind::Invalid => {
                return Err(JqError::WrongType(
                    "invalid value has no JSON representation".to_string(),
                ))
            }
            JvKind::Null => Value::Null,
            JvKind::False => Value::Bool(false),
            JvKind::True => Value::Bool(true),
            JvKind::Number => {
                let n = unsafe { (lib.jv_number_value)(self.raw) };
                if unsafe { (lib.jv_is_integer)(self.raw) } != 0 {
                    Value::from(n as i64)
                } else {
                    serde_json::Number::from_f64(n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            JvKind::String => Value::String(self.read_string()),
            JvKind::Array => {
                let len = unsafe { (lib.jv_array_length)(self.copy_raw()) };
                let mut items = Vec::with_capacity(len.max(0) as usize);
                for idx in 0..len {
                    let item =
                        unsafe { Jv::from_raw(lib, (lib.jv_array_get)(self.copy_raw(), idx)) };
                    items.push(item.to_value()?);
                }
                Value::Array(items)
            }
            JvKind::Object => {
                let mut map = serde_json::Map::new();
                unsafe {
                    let mut iter = (lib.jv_object_iter)(self.raw);
                    while (lib.jv_object_iter_valid)(self.raw, iter) != 0 {
                        let key = Jv::from_raw(lib, (lib.jv_object_iter_key)(self.raw, iter));
                        let item = Jv::from_raw(lib, (lib.jv_object_iter_value)(self.raw, iter));
                        map.insert(key.read_string(), item.to_value()?);
                        iter = (lib.jv_object_iter_next)(self.raw, iter);
                    }
                }
                Value::Object(map)
            }
        };
        Ok(value)
    }

    /// Returns the contents of a string value; `None` for other kinds.
    pub fn as_string(&self) -> Option<String> {
        match self.kind() {
            JvKind::String => Some(self.read_string()),
            _ => None,
        }
    }

    /// Serializes with the given print flags.
    pub fn dump(&self, flags: PrintFlags) -> String {
        let dumped =
            unsafe { Jv::from_raw(self.lib, (self.lib.jv_dump_string)(self.copy_raw(), flags.bits())) };
        dumped.read_string()
    }

    /// Extracts the message carried by an invalid value.
    ///
    /// Non-string messages are dumped as JSON. Returns `None` when the value
    /// carries no message (or is not invalid).
    pub fn invalid_message(self) -> Option<String> {
        let lib = self.lib;
        let msg = unsafe { Jv::from_raw(lib, (lib.jv_invalid_get_msg)(self.into_raw())) };
        match msg.kind() {
            JvKind::Null => None,
            JvKind::String => Some(msg.read_string()),
            _ => Some(msg.dump(PrintFlags::NONE)),
        }
    }

    /// Renders an error value reported by the engine, like jq's CLI does.
    ///
    /// Plain string diagnostics (compile errors) come back unchanged. An
    /// invalid value carrying a string message is rendered as
    /// `jq: error: <message>`; any other message is dumped and rendered as
    /// `jq: error: <dump> (not a string)`. Null and message-less invalids
    /// yield `None`.
    pub fn format_error(self) -> Option<String> {
        let lib = self.lib;
        let formatted = unsafe { Jv::from_raw(lib, (lib.jq_format_error)(self.into_raw())) };
        formatted.as_string()
    }

    fn copy_raw(&self) -> ffi::jv {
        unsafe { (self.lib.jv_copy)(self.raw) }
    }

    // Caller guarantees the kind is string.
    fn read_string(&self) -> String {
        unsafe {
            let len = (self.lib.jv_string_length_bytes)(self.copy_raw());
            let ptr = (self.lib.jv_string_value)(self.raw);
            if ptr.is_null() || len <= 0 {
                return String::new();
            }
            let bytes = slice::from_raw_parts(ptr.cast::<u8>(), len as usize);
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn text_len(text: &str) -> Result<c_int> {
    c_int::try_from(text.len())
        .map_err(|_| JqError::OperationFailed(format!("{} bytes is too long for libjq", text.len())))
}

impl Clone for Jv {
    fn clone(&self) -> Self {
        Jv {
            lib: self.lib,
            raw: self.copy_raw(),
        }
    }
}

impl Drop for Jv {
    fn drop(&mut self) {
        unsafe { (self.lib.jv_free)(self.raw) }
    }
}

impl fmt::Debug for Jv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump(PrintFlags::INVALID))
    }
}
