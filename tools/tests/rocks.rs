use qavm::cache::BlockContext;
use qavm::common::Addr;
use qavm::config::ExecutorConfig;
use qavm::exec::{Executor, FailureCause, TxOutcome};
use qavm::kernel::{self, Kernel};
use qavm::params::{instance_key, STATICS_KEY};
use qavm_tools::fixtures::*;
use qavm_tools::rocks::RocksKernel;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_rocks_kernel_roundtrip() {
    init();
    let dir = tempfile::TempDir::new().unwrap();
    let a = Addr::from(1);
    let b = Addr::from(2);
    {
        let mut k = RocksKernel::open(dir.path()).unwrap();
        k.put_storage(&a, b"key", vec![1, 2].into());
        k.put_storage(&b, b"key", vec![3].into());
        k.set_code(&a, vec![0xc0].into());
        k.set_transformed_code(&a, Some(vec![1, 0xc0].into()));
        k.set_transformed_code(&a, None);
        assert!(k.take_error().is_none());
    }
    let k = RocksKernel::open(dir.path()).unwrap();
    assert_eq!(k.get_storage(&a, b"key"), Some(vec![1, 2].into()));
    assert_eq!(k.get_storage(&b, b"key"), Some(vec![3].into()));
    assert_eq!(k.get_storage(&a, b"other"), None);
    assert_eq!(k.get_code(&a), Some(vec![0xc0].into()));
    assert_eq!(k.get_code(&b), None);
    assert_eq!(k.get_transformed_code(&a), None);
}

#[test]
fn test_contract_survives_reopen() {
    init();
    let dir = tempfile::TempDir::new().unwrap();
    let a = Addr::from(7);
    {
        let k = kernel::shared(RocksKernel::open(dir.path()).unwrap());
        let ex = Executor::new(ExecutorConfig::default());
        let r = ex.deploy(
            &k,
            &BlockContext::mainchain(1),
            &a,
            &linked_list().encode(),
            list_push(1),
        );
        assert_eq!(r.outcome.success(), Some(1));
        let r = ex.call(&k, &BlockContext::mainchain(2), &a, list_push(2));
        assert_eq!(r.outcome.success(), Some(2));
    }
    let k = RocksKernel::open(dir.path()).unwrap();
    assert!(k.get_storage(&a, STATICS_KEY).is_some());
    assert!(k.get_storage(&a, &instance_key(2)).is_some());
    let k = kernel::shared(k);
    // a new executor has nothing cached and reads everything back from disk
    let ex = Executor::new(ExecutorConfig::default());
    let r = ex.call(&k, &BlockContext::mainchain(3), &a, list_values);
    assert_eq!(r.outcome.success(), Some(vec![2, 1]));
}

#[test]
fn test_failed_writes_fail_the_transaction() {
    init();
    let dir = tempfile::TempDir::new().unwrap();
    let a = Addr::from(8);
    {
        let k = kernel::shared(RocksKernel::open(dir.path()).unwrap());
        let ex = Executor::new(ExecutorConfig::default());
        let r = ex.deploy(
            &k,
            &BlockContext::mainchain(1),
            &a,
            &linked_list().encode(),
            list_push(1),
        );
        assert!(r.outcome.is_success());
    }
    let mut ro = RocksKernel::open_read_only(dir.path()).unwrap();
    ro.put_storage(&a, b"x", vec![1].into());
    assert!(ro.take_error().is_some());
    assert!(ro.take_error().is_none());
    assert!(ro.take_fault().is_none());

    let k = kernel::shared(ro);
    let ex = Executor::new(ExecutorConfig::default());
    let r = ex.call(&k, &BlockContext::mainchain(2), &a, list_push(2));
    assert!(matches!(r.outcome, TxOutcome::Failed(FailureCause::Storage(_))));
    // reads still work, and nothing was written
    let r = ex.call(&k, &BlockContext::mainchain(3), &a, list_values);
    assert_eq!(r.outcome.success(), Some(vec![1]));
}
