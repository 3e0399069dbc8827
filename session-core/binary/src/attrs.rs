use std::str::FromStr;

use crate::error::{BinaryError, Result};
use crate::jid::Jid;
use crate::node::{Attrs, Node};

/// Collects attribute lookups and their failures so a handler can read every
/// field first and check for errors once.
pub struct AttrParser<'a> {
    pub attrs: &'a Attrs,
    pub errors: Vec<BinaryError>,
}

impl<'a> AttrParser<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self {
            attrs: &node.attrs,
            errors: Vec::new(),
        }
    }

    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn finish(&self) -> Result<()> {
        if self.ok() {
            Ok(())
        } else {
            Err(BinaryError::AttrList(self.errors.clone()))
        }
    }

    fn get_raw(&mut self, key: &str, require: bool) -> Option<&'a str> {
        let val = self.attrs.get(key).map(String::as_str);
        if require && val.is_none() {
            self.errors.push(BinaryError::AttrParse(format!(
                "Required attribute '{key}' not found"
            )));
        }
        val
    }

    pub fn optional_string(&mut self, key: &str) -> Option<&'a str> {
        self.get_raw(key, false)
    }

    pub fn required_string(&mut self, key: &str) -> Result<&'a str> {
        self.optional_string(key)
            .ok_or_else(|| BinaryError::MissingAttr(key.to_string()))
    }

    pub fn optional_jid(&mut self, key: &str) -> Option<Jid> {
        let raw = self.get_raw(key, false)?;
        match Jid::from_str(raw) {
            Ok(jid) => Some(jid),
            Err(e) => {
                self.errors.push(BinaryError::from(e));
                None
            }
        }
    }

    pub fn jid(&mut self, key: &str) -> Jid {
        self.get_raw(key, true);
        self.optional_jid(key).unwrap_or_default()
    }

    pub fn optional_u64(&mut self, key: &str) -> Option<u64> {
        self.parse_with(key, false)
    }

    pub fn optional_i64(&mut self, key: &str) -> Option<i64> {
        self.parse_with(key, false)
    }

    pub fn optional_bool(&mut self, key: &str) -> bool {
        self.parse_with::<bool>(key, false).unwrap_or(false)
    }

    fn parse_with<T>(&mut self, key: &str, require: bool) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.get_raw(key, require)?;
        match raw.parse::<T>() {
            Ok(val) => Some(val),
            Err(e) => {
                self.errors.push(BinaryError::AttrParse(format!(
                    "Failed to parse '{raw}' for key '{key}': {e}"
                )));
                None
            }
        }
    }
}
