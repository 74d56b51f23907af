//! Chain-aware cache of transformed code and object graph roots.
//!
//! Every entry is stamped with the block that produced it. Whether an entry may be used depends on
//! where the block being executed sits relative to the chain the cache follows:
//!
//! - mainchain (and mining, and a block that switches the mainchain): an entry is usable when it
//!   was produced by the parent block or earlier. A newer entry can only come from a block that
//!   was later abandoned and is evicted.
//! - sidechain: an entry is usable when it was produced at or before the common ancestor with the
//!   mainchain. Code produced on the sidechain goes to a separate generation; graph roots are not
//!   written at all.
//! - deep sidechain: the cache is bypassed.
//! - `eth_call`: reads follow the sidechain rule and nothing is written.
//!
//! Entries are published whole behind an `Arc`, so a reader sees either the old entry or the new
//! one.

use std::collections::hash_map::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::common::{Addr, BlockNumber, Bytes};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    AssumeMainchain,
    AssumeSidechain,
    AssumeDeepSidechain,
    SwitchingMainchain,
    Mining,
    EthCall,
}

impl ExecutionType {
    fn follows_mainchain(self) -> bool {
        matches!(
            self,
            ExecutionType::AssumeMainchain |
                ExecutionType::Mining |
                ExecutionType::SwitchingMainchain
        )
    }
}

/// Where the block being executed sits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockContext {
    pub number: BlockNumber,
    pub mode: ExecutionType,
    /// last block shared with the mainchain the cache follows
    pub common_ancestor: BlockNumber,
}

impl BlockContext {
    pub fn new(
        number: BlockNumber, mode: ExecutionType, common_ancestor: BlockNumber,
    ) -> Self {
        Self {
            number,
            mode,
            common_ancestor,
        }
    }

    pub fn mainchain(number: BlockNumber) -> Self {
        Self::new(
            number,
            ExecutionType::AssumeMainchain,
            number.saturating_sub(1),
        )
    }

    pub fn mining(number: BlockNumber) -> Self {
        Self::new(number, ExecutionType::Mining, number.saturating_sub(1))
    }

    pub fn sidechain(number: BlockNumber, common_ancestor: BlockNumber) -> Self {
        Self::new(number, ExecutionType::AssumeSidechain, common_ancestor)
    }

    pub fn deep_sidechain(number: BlockNumber) -> Self {
        Self::new(number, ExecutionType::AssumeDeepSidechain, 0)
    }

    pub fn switching(number: BlockNumber, common_ancestor: BlockNumber) -> Self {
        Self::new(number, ExecutionType::SwitchingMainchain, common_ancestor)
    }

    pub fn eth_call(number: BlockNumber, common_ancestor: BlockNumber) -> Self {
        Self::new(number, ExecutionType::EthCall, common_ancestor)
    }
}

#[derive(Debug)]
pub struct CacheEntry {
    pub block: BlockNumber,
    pub payload: Bytes,
}

type Generation = RwLock<HashMap<Addr, Arc<CacheEntry>>>;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
pub struct ExecutionCache {
    code: Generation,
    side_code: Generation,
    graphs: Generation,
    /// block at which the last mainchain switch was applied
    switched_at: Mutex<Option<BlockNumber>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ExecutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Prepare for an execution in `ctx`. A block that switches the mainchain drops what the
    /// abandoned branch produced and adopts the sidechain's code, once per block.
    pub fn begin(&self, ctx: &BlockContext) {
        if ctx.mode != ExecutionType::SwitchingMainchain {
            return
        }
        let mut switched = self.switched_at.lock();
        if *switched == Some(ctx.number) {
            return
        }
        *switched = Some(ctx.number);
        let ancestor = ctx.common_ancestor;
        let mut dropped = 0;
        for gen in [&self.code, &self.graphs] {
            let mut g = gen.write();
            let before = g.len();
            g.retain(|_, e| e.block <= ancestor);
            dropped += before - g.len();
        }
        let promoted: Vec<_> = self.side_code.write().drain().collect();
        let mut code = self.code.write();
        for (addr, e) in promoted.iter() {
            match code.get(addr) {
                Some(cur) if cur.block >= e.block => (),
                _ => {
                    code.insert(*addr, e.clone());
                }
            }
        }
        debug!(
            "mainchain switch at {} (ancestor {}): dropped {}, promoted {}",
            ctx.number,
            ancestor,
            dropped,
            promoted.len()
        );
    }

    pub fn lookup_code(&self, addr: &Addr, ctx: &BlockContext) -> Option<Bytes> {
        let r = match ctx.mode {
            ExecutionType::AssumeDeepSidechain => return None,
            m if m.follows_mainchain() => self.lookup_parent(&self.code, addr, ctx),
            ExecutionType::AssumeSidechain => {
                Self::lookup_until(&self.code, addr, ctx.common_ancestor)
                    .or_else(|| {
                        Self::lookup_until(
                            &self.side_code,
                            addr,
                            ctx.number.saturating_sub(1),
                        )
                    })
            }
            _ => Self::lookup_until(&self.code, addr, ctx.common_ancestor),
        };
        self.count(addr, "code", r)
    }

    pub fn lookup_graph(&self, addr: &Addr, ctx: &BlockContext) -> Option<Bytes> {
        let r = match ctx.mode {
            ExecutionType::AssumeDeepSidechain => return None,
            m if m.follows_mainchain() => {
                self.lookup_parent(&self.graphs, addr, ctx)
            }
            _ => Self::lookup_until(&self.graphs, addr, ctx.common_ancestor),
        };
        self.count(addr, "graph", r)
    }

    /// Record code used (or produced) by an execution. Code does not depend on the outcome.
    pub fn write_code(&self, addr: &Addr, ctx: &BlockContext, code: Bytes) {
        match ctx.mode {
            m if m.follows_mainchain() => {
                Self::publish(&self.code, addr, ctx.number, code)
            }
            ExecutionType::AssumeSidechain => {
                Self::publish(&self.side_code, addr, ctx.number, code)
            }
            _ => (),
        }
    }

    /// Record the graph root left by a successful execution.
    pub fn write_graph(&self, addr: &Addr, ctx: &BlockContext, root: Bytes) {
        if ctx.mode.follows_mainchain() {
            Self::publish(&self.graphs, addr, ctx.number, root)
        }
    }

    pub fn invalidate(&self, addr: &Addr) {
        for gen in [&self.code, &self.side_code, &self.graphs] {
            gen.write().remove(addr);
        }
    }

    pub fn reset(&self) {
        for gen in [&self.code, &self.side_code, &self.graphs] {
            gen.write().clear()
        }
        *self.switched_at.lock() = None;
        debug!("execution cache reset");
    }

    fn publish(gen: &Generation, addr: &Addr, block: BlockNumber, payload: Bytes) {
        trace!("cache publish {} at block {}", addr, block);
        gen.write()
            .insert(*addr, Arc::new(CacheEntry { block, payload }));
    }

    fn lookup_until(
        gen: &Generation, addr: &Addr, last: BlockNumber,
    ) -> Option<Bytes> {
        gen.read()
            .get(addr)
            .filter(|e| e.block <= last)
            .map(|e| e.payload.clone())
    }

    /// Mainchain lookup: entries from the parent block or earlier are usable, newer ones are
    /// evicted.
    fn lookup_parent(
        &self, gen: &Generation, addr: &Addr, ctx: &BlockContext,
    ) -> Option<Bytes> {
        let entry = gen.read().get(addr).cloned()?;
        if entry.block < ctx.number {
            return Some(entry.payload.clone())
        }
        let mut g = gen.write();
        if let Some(cur) = g.get(addr) {
            if Arc::ptr_eq(cur, &entry) {
                g.remove(addr);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "evict {} stamped {} while executing block {}",
                    addr, entry.block, ctx.number
                );
            }
        }
        None
    }

    fn count(&self, addr: &Addr, what: &str, r: Option<Bytes>) -> Option<Bytes> {
        match &r {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!("cache hit: {} of {}", what, addr)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!("cache miss: {} of {}", what, addr)
            }
        }
        r
    }
}
