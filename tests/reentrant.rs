use qavm::cache::BlockContext;
use qavm::common::{Addr, Bytes};
use qavm::config::ExecutorConfig;
use qavm::exec::{CallError, Executor, Invocation, TxOutcome};
use qavm::kernel::{self, SharedKernel};
use qavm::params::{instance_key, STATICS_KEY};
use qavm::persist::graph::{GraphWriter, VisitOrder};
use qavm::persist::object::{ObjectRef, Value};
use qavm::persist::PersistError;
use qavm_tools::dummy::DummyKernel;
use qavm_tools::fixtures::*;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn deploy_list(ex: &Executor, values: &[i32]) -> (SharedKernel, Addr) {
    let kernel = kernel::shared(DummyKernel::new());
    let a = Addr::from(0x11);
    let r = ex.deploy(
        &kernel,
        &BlockContext::mainchain(1),
        &a,
        &linked_list().encode(),
        |inv| {
            for v in values {
                list_push(*v)(inv)?;
            }
            Ok(())
        },
    );
    assert!(r.outcome.is_success());
    (kernel, a)
}

fn head(inv: &Invocation) -> ObjectRef {
    inv.dapp()
        .get_static("List", "head")
        .unwrap()
        .as_object()
        .unwrap()
        .clone()
}

/// The root record and the first few instance records, as stored.
fn stored(kernel: &SharedKernel, a: &Addr) -> Vec<Option<Bytes>> {
    let k = kernel.read();
    let mut v = vec![k.get_storage(a, STATICS_KEY)];
    v.extend((1..=4).map(|id| k.get_storage(a, &instance_key(id))));
    v
}

/// Every object reachable from the statics, encoded in visit order.
fn image(inv: &Invocation) -> Result<Vec<u8>, PersistError> {
    let d = inv.dapp();
    let mut w = GraphWriter::new(VisitOrder::new(), d.constants());
    let mut out = Vec::new();
    for class in d.classes().load_order() {
        out.extend(w.serialize_statics(class)?.encode());
    }
    while let Some((_, o)) = w.next_queued() {
        out.extend(w.serialize_instance(&o)?.encode());
    }
    Ok(out)
}

/// Bump the head's value and push one node.
fn mutate(inv: &mut Invocation) -> Result<(), CallError> {
    let h = head(inv);
    let v = h.get_field("value")?.as_int().unwrap_or(0);
    h.set_field("value", Value::Int(v + 100))?;
    list_push(99)(inv)?;
    Ok(())
}

#[test]
fn test_commit_and_revert_are_symmetric() {
    init();
    let ex = Executor::new(ExecutorConfig::default());
    let (kernel, a) = deploy_list(&ex, &[1, 2, 3]);
    let r = ex.call(&kernel, &BlockContext::mainchain(2), &a, |inv| {
        let before = head(inv);
        let second = before.get_field("next")?;

        let cp = inv.capture()?;
        mutate(inv)?;
        assert!(!head(inv).ptr_eq(&before));
        inv.revert(cp)?;
        assert!(head(inv).ptr_eq(&before));
        assert_eq!(before.get_field("next")?, second);
        assert_eq!(list_values(inv)?, vec![3, 2, 1]);

        let cp = inv.capture()?;
        mutate(inv)?;
        inv.commit(cp).map_err(|f| CallError::Fatal(f.error))?;
        // the old head keeps its identity and sees the callee's write
        assert!(head(inv).get_field("next")?.as_object().unwrap().ptr_eq(&before));
        assert_eq!(before.get_field("value")?, Value::Int(103));
        assert_eq!(before.get_field("next")?, second);
        list_values(inv)
    });
    assert_eq!(r.outcome.success(), Some(vec![99, 103, 2, 1]));

    let r = ex.call(&kernel, &BlockContext::mainchain(3), &a, list_values);
    assert_eq!(r.outcome.success(), Some(vec![99, 103, 2, 1]));
}

#[test]
fn test_exhausted_commit_reverts_to_capture() {
    init();
    let ex = Executor::new(ExecutorConfig {
        energy_limit: 6_000,
        ..Default::default()
    });
    let (kernel, a) = deploy_list(&ex, &[1]);
    let records = stored(&kernel, &a);
    assert!(records[1].is_some() && records[2].is_none());
    let r = ex.call(&kernel, &BlockContext::mainchain(2), &a, |inv| {
        let before = head(inv);
        let bytes = image(inv)?;
        let r = inv.reentrant(|inv| {
            for i in 0..300 {
                list_push(i)(inv)?;
            }
            Ok(())
        });
        assert!(matches!(
            r,
            Err(CallError::Fatal(PersistError::ResourceExhausted(_)))
        ));
        assert_eq!(inv.depth(), 0);
        assert!(head(inv).ptr_eq(&before));
        assert_eq!(image(inv)?, bytes);
        assert_eq!(list_values(inv)?, vec![1]);
        assert_eq!(inv.dapp().get_static("List", "size")?, Value::Int(1));
        Ok(())
    });
    assert!(!r.outcome.is_success());
    assert_eq!(stored(&kernel, &a), records);

    let ex = Executor::new(ExecutorConfig::default());
    let r = ex.call(&kernel, &BlockContext::mainchain(3), &a, list_values);
    assert_eq!(r.outcome.success(), Some(vec![1]));
}

#[test]
fn test_nested_reentrancy() {
    init();
    let ex = Executor::new(ExecutorConfig {
        max_reentrant_depth: 2,
        ..Default::default()
    });
    let (kernel, a) = deploy_list(&ex, &[1]);
    let r = ex.call(&kernel, &BlockContext::mainchain(2), &a, |inv| {
        let r = inv.reentrant(|inv| {
            list_push(2)(inv)?;
            inv.reentrant(|inv| {
                list_push(3)(inv)?;
                let too_deep = inv.reentrant(|_| Ok(()));
                assert!(matches!(
                    too_deep,
                    Err(CallError::Fatal(PersistError::InvalidState(_)))
                ));
                Err::<(), _>(CallError::Revert("inner".into()))
            })
            .or_else(|e| match e {
                CallError::Revert(_) => Ok(()),
                e => Err(e),
            })?;
            list_values(inv)
        })?;
        assert_eq!(r, vec![2, 1]);
        list_values(inv)
    });
    assert_eq!(r.outcome.success(), Some(vec![2, 1]));
}

#[test]
fn test_open_checkpoint_fails_the_transaction() {
    init();
    let ex = Executor::new(ExecutorConfig::default());
    let (kernel, a) = deploy_list(&ex, &[1]);
    let r = ex.call(&kernel, &BlockContext::mainchain(2), &a, |inv| {
        let _open = inv.capture()?;
        list_push(5)(inv)?;
        Ok(())
    });
    assert!(matches!(r.outcome, TxOutcome::Failed(_)));
    let r = ex.call(&kernel, &BlockContext::mainchain(3), &a, list_values);
    assert_eq!(r.outcome.success(), Some(vec![1]));
}
