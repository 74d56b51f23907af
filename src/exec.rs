//! Runs one transaction against a contract.
//!
//! The executor finds the contract's transformed code and the root record of its object graph
//! (execution cache first, then the kernel), restores the contract, and hands an [Invocation] to
//! the transaction body. All kernel writes go through a [KernelOverlay] that is published only
//! when the body succeeds and its graph is saved, so a reverted or failed transaction leaves the
//! kernel as it was. The cache is updated according to the [BlockContext] of the execution.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::cache::{BlockContext, ExecutionCache, ExecutionType};
use crate::code::{CodeTransformer, DAppCode, StandardTransformer, TransformError};
use crate::common::{Addr, Bytes};
use crate::config::ExecutorConfig;
use crate::dapp::LoadedDApp;
use crate::kernel::{Kernel, KernelOverlay, SharedKernel};
use crate::params::TRANSFORMED_CODE_VERSION;
use crate::persist::constants::ConstantTable;
use crate::persist::fee::{EnergyFees, SharedFees};
use crate::persist::reentrant::{Checkpoint, CheckpointStack, CommitFailure};
use crate::persist::PersistError;

/// How a transaction body (or a reentrant call inside it) stops early.
#[derive(Debug, Error)]
pub enum CallError {
    /// The contract gave up. Its changes are dropped, the transaction itself did not fail.
    #[error("reverted: {0}")]
    Revert(String),
    #[error(transparent)]
    Fatal(#[from] PersistError),
}

#[derive(Debug, Error)]
pub enum FailureCause {
    #[error("no code at {0}")]
    NoCode(Addr),
    #[error("no object graph at {0}")]
    NoGraph(Addr),
    #[error("a contract is already deployed at {0}")]
    AlreadyDeployed(Addr),
    #[error("code transformation failed: {0}")]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("{0} reentrant calls were left open")]
    UnbalancedReentrancy(usize),
    #[error("storage failure: {0}")]
    Storage(String),
}

#[derive(Debug)]
pub enum TxOutcome<R> {
    Success(R),
    Reverted(String),
    Failed(FailureCause),
}

impl<R> TxOutcome<R> {
    pub fn is_success(&self) -> bool {
        matches!(self, TxOutcome::Success(_))
    }

    pub fn success(self) -> Option<R> {
        match self {
            TxOutcome::Success(r) => Some(r),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TxOutcome::Success(_) => "success",
            TxOutcome::Reverted(_) => "reverted",
            TxOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
pub struct Receipt<R> {
    pub outcome: TxOutcome<R>,
    /// energy charged for graph traffic
    pub energy_used: u64,
}

/// The running transaction as its body sees it.
pub struct Invocation<'a> {
    dapp: &'a LoadedDApp,
    block: BlockContext,
    stack: CheckpointStack,
}

impl<'a> Invocation<'a> {
    pub fn dapp(&self) -> &LoadedDApp {
        self.dapp
    }

    pub fn block(&self) -> &BlockContext {
        &self.block
    }

    /// Number of reentrant calls currently open.
    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    /// Enter the contract again: `f` runs against a separate copy of the contract's graph, which
    /// is written back if `f` succeeds and dropped otherwise.
    pub fn reentrant<R, F>(&mut self, f: F) -> Result<R, CallError>
    where
        F: FnOnce(&mut Self) -> Result<R, CallError>,
    {
        let cp = self.capture()?;
        match f(self) {
            Ok(r) => match self.stack.commit(cp) {
                Ok(()) => Ok(r),
                Err(CommitFailure { checkpoint, error }) => {
                    warn!("reentrant commit failed: {}", error);
                    self.stack.revert(checkpoint)?;
                    Err(CallError::Fatal(error))
                }
            },
            Err(e) => {
                self.stack.revert(cp)?;
                Err(e)
            }
        }
    }

    pub fn capture(&mut self) -> Result<Checkpoint, PersistError> {
        let d = self.dapp;
        self.stack.capture(d.classes(), d.constants(), d.fees())
    }

    pub fn commit(&mut self, cp: Checkpoint) -> Result<(), CommitFailure> {
        self.stack.commit(cp)
    }

    pub fn revert(&mut self, cp: Checkpoint) -> Result<(), PersistError> {
        self.stack.revert(cp)
    }
}

pub struct Executor {
    config: ExecutorConfig,
    cache: Arc<ExecutionCache>,
    transformer: Arc<dyn CodeTransformer>,
    constants: Arc<ConstantTable>,
}

/// Per-transaction state shared by deploy and call.
struct Tx {
    overlay: Arc<RwLock<KernelOverlay>>,
    fees: Arc<Mutex<EnergyFees>>,
}

impl Tx {
    fn kernel(&self) -> SharedKernel {
        self.overlay.clone()
    }

    fn fees(&self) -> SharedFees {
        self.fees.clone()
    }

    fn check_kernel(&self) -> Result<(), FailureCause> {
        match self.overlay.read().take_fault() {
            Some(f) => Err(FailureCause::Storage(f)),
            None => Ok(()),
        }
    }
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            cache: Arc::new(ExecutionCache::new()),
            transformer: Arc::new(StandardTransformer),
            constants: ConstantTable::empty(),
        }
    }

    /// Share a cache between executors.
    pub fn with_cache(mut self, cache: Arc<ExecutionCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_transformer(mut self, t: Arc<dyn CodeTransformer>) -> Self {
        self.transformer = t;
        self
    }

    pub fn with_constants(mut self, constants: Arc<ConstantTable>) -> Self {
        self.constants = constants;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ExecutionCache> {
        &self.cache
    }

    fn begin(&self, kernel: &SharedKernel, ctx: &BlockContext) -> Tx {
        if self.config.cache_enabled {
            self.cache.begin(ctx)
        }
        Tx {
            overlay: Arc::new(RwLock::new(KernelOverlay::new(kernel.clone()))),
            fees: Arc::new(Mutex::new(EnergyFees::new(
                self.config.energy_limit,
                self.config.fees.clone(),
            ))),
        }
    }

    fn receipt<R>(
        &self, tx: Tx, addr: &Addr, ctx: &BlockContext,
        r: Result<TxOutcome<R>, FailureCause>,
    ) -> Receipt<R> {
        // whatever went wrong, a storage fault behind it is the real cause
        let outcome = match tx.check_kernel() {
            Err(cause) => TxOutcome::Failed(cause),
            Ok(()) => r.unwrap_or_else(TxOutcome::Failed),
        };
        if let TxOutcome::Failed(cause) = &outcome {
            warn!("{} at block {}: transaction failed: {}", addr, ctx.number, cause)
        }
        let energy_used = tx.fees.lock().used();
        debug!(
            "{} at block {} ({:?}): {}, {} energy",
            addr,
            ctx.number,
            ctx.mode,
            outcome.label(),
            energy_used
        );
        Receipt {
            outcome,
            energy_used,
        }
    }

    /// Deploy `raw` code at `addr` and run `init` against the fresh contract.
    pub fn deploy<R, F>(
        &self, kernel: &SharedKernel, ctx: &BlockContext, addr: &Addr,
        raw: &[u8], init: F,
    ) -> Receipt<R>
    where
        F: FnOnce(&mut Invocation) -> Result<R, CallError>,
    {
        let tx = self.begin(kernel, ctx);
        let r = self.try_deploy(&tx, ctx, addr, raw, init);
        self.receipt(tx, addr, ctx, r)
    }

    fn try_deploy<R, F>(
        &self, tx: &Tx, ctx: &BlockContext, addr: &Addr, raw: &[u8], init: F,
    ) -> Result<TxOutcome<R>, FailureCause>
    where
        F: FnOnce(&mut Invocation) -> Result<R, CallError>,
    {
        if tx.overlay.read().get_code(addr).is_some() {
            return Err(FailureCause::AlreadyDeployed(*addr))
        }
        let transformed = self.transformer.transform(raw)?;
        let code = DAppCode::from_transformed(&transformed)?;
        {
            let mut o = tx.overlay.write();
            o.set_code(addr, raw.into());
            o.set_transformed_code(addr, Some(transformed.clone()));
        }
        let dapp = LoadedDApp::new(
            *addr,
            tx.kernel(),
            &code,
            self.constants.clone(),
            tx.fees(),
        )?;
        self.run(tx, &dapp, ctx, Some(transformed), init)
    }

    /// Run `body` against the contract deployed at `addr`.
    pub fn call<R, F>(
        &self, kernel: &SharedKernel, ctx: &BlockContext, addr: &Addr, body: F,
    ) -> Receipt<R>
    where
        F: FnOnce(&mut Invocation) -> Result<R, CallError>,
    {
        let tx = self.begin(kernel, ctx);
        let r = self.try_call(&tx, ctx, addr, body);
        self.receipt(tx, addr, ctx, r)
    }

    fn try_call<R, F>(
        &self, tx: &Tx, ctx: &BlockContext, addr: &Addr, body: F,
    ) -> Result<TxOutcome<R>, FailureCause>
    where
        F: FnOnce(&mut Invocation) -> Result<R, CallError>,
    {
        let (transformed, cached) = self.find_code(tx, ctx, addr)?;
        let code = DAppCode::from_transformed(&transformed)?;
        let root = self.find_graph(tx, ctx, addr)?;
        let dapp = LoadedDApp::load(
            *addr,
            tx.kernel(),
            &code,
            self.constants.clone(),
            tx.fees(),
            &root,
        )?;
        let fresh = if cached { None } else { Some(transformed) };
        self.run(tx, &dapp, ctx, fresh, body)
    }

    /// Transformed code of `addr` and whether it came from the cache. Code the kernel does not
    /// hold in the current format is transformed again from the deployed code.
    fn find_code(
        &self, tx: &Tx, ctx: &BlockContext, addr: &Addr,
    ) -> Result<(Bytes, bool), FailureCause> {
        if self.config.cache_enabled {
            if let Some(c) = self.cache.lookup_code(addr, ctx) {
                return Ok((c, true))
            }
        }
        let stored = tx.overlay.read().get_transformed_code(addr);
        match stored {
            Some(c) if c.first() == Some(&TRANSFORMED_CODE_VERSION) => {
                return Ok((c, false))
            }
            Some(_) => warn!("{}: stale transformed code", addr),
            None => (),
        }
        let raw = tx
            .overlay
            .read()
            .get_code(addr)
            .ok_or(FailureCause::NoCode(*addr))?;
        let c = self.transformer.transform(&raw)?;
        debug!("{}: code transformed again ({} bytes)", addr, c.len());
        tx.overlay.write().set_transformed_code(addr, Some(c.clone()));
        Ok((c, false))
    }

    fn find_graph(
        &self, tx: &Tx, ctx: &BlockContext, addr: &Addr,
    ) -> Result<Bytes, FailureCause> {
        if self.config.cache_enabled {
            if let Some(g) = self.cache.lookup_graph(addr, ctx) {
                return Ok(g)
            }
        }
        let root = tx.overlay.read().get_object_graph(addr);
        root.ok_or(FailureCause::NoGraph(*addr))
    }

    /// Run the body, then save and publish on success. `fresh_code` is code that did not come
    /// from the cache.
    fn run<R, F>(
        &self, tx: &Tx, dapp: &LoadedDApp, ctx: &BlockContext,
        fresh_code: Option<Bytes>, body: F,
    ) -> Result<TxOutcome<R>, FailureCause>
    where
        F: FnOnce(&mut Invocation) -> Result<R, CallError>,
    {
        let mut inv = Invocation {
            dapp,
            block: *ctx,
            stack: CheckpointStack::new(self.config.max_reentrant_depth),
        };
        let r = body(&mut inv);
        let open = inv.depth();
        if open > 0 {
            inv.stack.revert_all()?;
            return Err(FailureCause::UnbalancedReentrancy(open))
        }
        let addr = dapp.address();
        let cache = self.config.cache_enabled;
        match r {
            Ok(v) => {
                let root = dapp.save()?;
                tx.check_kernel()?;
                if ctx.mode != ExecutionType::EthCall {
                    tx.overlay.write().commit();
                    tx.check_kernel()?;
                }
                if cache {
                    if let Some(code) = fresh_code {
                        self.cache.write_code(addr, ctx, code)
                    }
                    self.cache.write_graph(addr, ctx, root);
                }
                Ok(TxOutcome::Success(v))
            }
            Err(CallError::Revert(msg)) => {
                if let (true, Some(code)) = (cache, fresh_code) {
                    self.cache.write_code(addr, ctx, code)
                }
                Ok(TxOutcome::Reverted(msg))
            }
            Err(CallError::Fatal(e)) => Err(e.into()),
        }
    }
}
