// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};

use crate::error::{decode_error, Error};
use crate::pool::{BufferPool, HeapAllocator, SinglePool};

/// Wire flavor spoken with the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Encoding {
    /// JSON lines, content slots as JSON values.
    JsonObject,
    /// JSON lines, each content slot separately JSON encoded.
    JsonEncoded,
    /// Varint length-prefixed binary frames.
    #[serde(alias = "protobuf")]
    Binary,
}

impl Default for Encoding {
    fn default() -> Encoding {
        Encoding::JsonObject
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Encoding, Error> {
        match s {
            "jsonObject" => Ok(Encoding::JsonObject),
            "jsonEncoded" => Ok(Encoding::JsonEncoded),
            "binary" | "protobuf" => Ok(Encoding::Binary),
            _ => Err(Error::Decode(format!("unknown encoding \"{}\"", s))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::JsonObject => "jsonObject",
            Encoding::JsonEncoded => "jsonEncoded",
            Encoding::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// Buffer reuse policy for the binary codec.
///
/// Frames vary in size, so only size-agnostic pools are offered here.
/// `FixedPool` suits callers whose buffers all share one size and is built
/// directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PoolKind {
    Heap,
    Single,
}

impl Default for PoolKind {
    fn default() -> PoolKind {
        PoolKind::Single
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub encoding: Encoding,
    /// Ask the engine which tasks each non-direct emit was routed to.
    pub need_task_ids: bool,
    pub pool: PoolKind,
    /// Back pooled buffers with page mappings instead of the heap.
    pub mapped_buffers: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            encoding: Encoding::default(),
            need_task_ids: true,
            pool: PoolKind::default(),
            mapped_buffers: false,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Config, Error> {
        serde_json::from_str(s).map_err(|e| decode_error("config", e))
    }

    pub fn buffer_pool(&self) -> Box<dyn BufferPool> {
        #[cfg(target_os = "linux")]
        {
            if self.mapped_buffers {
                return build_pool(self.pool, crate::mapped::MappedAllocator);
            }
        }
        build_pool(self.pool, HeapAllocator)
    }
}

fn build_pool<A>(kind: PoolKind, allocator: A) -> Box<dyn BufferPool>
where
    A: BufferPool + 'static,
{
    match kind {
        PoolKind::Heap => Box::new(allocator),
        PoolKind::Single => Box::new(SinglePool::new(allocator)),
    }
}
