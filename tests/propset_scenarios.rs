//! Black-box coverage of propset storage through the `Runtime` facade:
//! `Runtime::propsets_mut()` plus the type table, rather than poking at
//! `PropsetPool` directly (that's covered in-module).

use smalls_rt::core::value::{ObjectHandle, TypeId, Value};
use smalls_rt::propset::pool::{PropsetError, PropsetTypeInfo};
use smalls_rt::runtime::config::RuntimeConfig;
use smalls_rt::runtime::context::Runtime;

const STATS_TYPE: TypeId = TypeId(42);

fn runtime_with_stats_propset() -> Runtime {
    let mut runtime = Runtime::initialize(RuntimeConfig::default());
    runtime.propsets_mut().register_type(PropsetTypeInfo {
        type_id: STATS_TYPE,
        field_count: 2, // { str: int; dex: int }
        unmanaged_array_fields: vec![],
    });
    runtime
}

#[test]
fn writing_a_field_dirties_the_slot_and_clears_static() {
    let mut runtime = runtime_with_stats_propset();
    let creature = ObjectHandle { generation: 1, id: 100 };

    let rf = runtime
        .propsets_mut()
        .get_or_create(runtime.types(), STATS_TYPE, creature)
        .unwrap();
    assert!(runtime.propsets_mut().is_static_and_clean(rf));

    runtime.propsets_mut().write_field(rf, 0, Value::Int(10)).unwrap();
    assert!(!runtime.propsets_mut().is_static_and_clean(rf));
    assert_eq!(runtime.propsets_mut().read_field(rf, 0, false).unwrap(), Value::Int(10));
}

#[test]
fn destroying_the_owner_and_pruning_reclaims_the_slot() {
    let mut runtime = runtime_with_stats_propset();
    let creature = ObjectHandle { generation: 1, id: 101 };

    let rf = runtime
        .propsets_mut()
        .get_or_create(runtime.types(), STATS_TYPE, creature)
        .unwrap();
    runtime.propsets_mut().write_field(rf, 0, Value::Int(5)).unwrap();

    // The creature no longer exists from the host's point of view.
    runtime.prune_propset_owners(|id| id != 101);

    let err = runtime.propsets_mut().read_field(rf, 0, false).unwrap_err();
    assert_eq!(err, PropsetError::DanglingReference);

    // The slot is reusable for a fresh object once pruned.
    let other = ObjectHandle { generation: 1, id: 202 };
    let rf2 = runtime
        .propsets_mut()
        .get_or_create(runtime.types(), STATS_TYPE, other)
        .unwrap();
    assert!(runtime.propsets_mut().is_static_and_clean(rf2));
}

#[test]
fn get_or_create_is_idempotent_for_the_same_owner() {
    let mut runtime = runtime_with_stats_propset();
    let creature = ObjectHandle { generation: 1, id: 303 };

    let a = runtime
        .propsets_mut()
        .get_or_create(runtime.types(), STATS_TYPE, creature)
        .unwrap();
    let b = runtime
        .propsets_mut()
        .get_or_create(runtime.types(), STATS_TYPE, creature)
        .unwrap();
    assert_eq!(a, b);
}
