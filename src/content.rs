// Copyright 2020 Joyent, Inc.

//! Tuple content slots.
//!
//! Each codec flavor carries content slots differently: the object flavor
//! embeds them as JSON values, the encoded and binary flavors carry opaque
//! bytes. [`Content`] and [`ContentMut`] let a codec produce and consume
//! either representation without knowing the concrete slot type. Both are
//! implemented for every serde type, encoding the opaque form as JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{decode_error, encode_error, Error};

/// A value that can be emitted as a tuple content slot.
pub trait Content {
    fn to_value(&self) -> Result<Value, Error>;
    fn to_bytes(&self) -> Result<Vec<u8>, Error>;
}

/// A destination that an incoming content slot is decoded into.
pub trait ContentMut {
    fn set_value(&mut self, value: Value) -> Result<(), Error>;
    fn set_bytes(&mut self, bytes: &[u8]) -> Result<(), Error>;
}

impl<T: Serialize + ?Sized> Content for T {
    fn to_value(&self) -> Result<Value, Error> {
        serde_json::to_value(self).map_err(|e| encode_error("content slot", e))
    }

    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| encode_error("content slot", e))
    }
}

impl<T: DeserializeOwned> ContentMut for T {
    fn set_value(&mut self, value: Value) -> Result<(), Error> {
        *self = serde_json::from_value(value)
            .map_err(|e| decode_error("content slot", e))?;
        Ok(())
    }

    fn set_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        *self = serde_json::from_slice(bytes)
            .map_err(|e| decode_error("content slot", e))?;
        Ok(())
    }
}
