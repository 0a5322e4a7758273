//! Black-box coverage of VM_OWNED handle finalization: a handle interned
//! with `OwnershipMode::VmOwned` is not itself a GC root, so once nothing
//! else keeps its backing cell reachable, the next `collect_minor` call
//! must run its registered destructor exactly once and drop the handle
//! from the registry.

use smalls_rt::core::value::{OwnershipMode, TypeId, TypedHandle};
use smalls_rt::runtime::config::RuntimeConfig;
use smalls_rt::runtime::context::Runtime;
use std::cell::RefCell;
use std::rc::Rc;

const WIDGET_KIND: u8 = 1;

#[test]
fn unreachable_vm_owned_handle_is_finalized_exactly_once() {
    let mut runtime = Runtime::initialize(RuntimeConfig::default());

    let calls = Rc::new(RefCell::new(0u32));
    let calls_in_destructor = Rc::clone(&calls);
    runtime.register_handle_destructor(WIDGET_KIND, move |_ptr| {
        *calls_in_destructor.borrow_mut() += 1;
    });

    let ptr = runtime.heap_mut().allocate(16, 8, TypeId(99));
    let handle = TypedHandle {
        generation: 1,
        kind: WIDGET_KIND,
        id: 1,
    };
    runtime.intern_handle(handle, OwnershipMode::VmOwned, ptr);
    assert_eq!(runtime.lookup_handle(handle), Some(ptr));

    runtime.collect_minor();
    assert_eq!(*calls.borrow(), 1);
    assert_eq!(runtime.lookup_handle(handle), None);

    // A second sweep must not invoke the destructor again; the registry
    // entry is already gone.
    runtime.collect_minor();
    assert_eq!(*calls.borrow(), 1);
}

#[test]
fn engine_owned_handle_survives_as_a_root_and_is_not_finalized() {
    let mut runtime = Runtime::initialize(RuntimeConfig::default());

    let calls = Rc::new(RefCell::new(0u32));
    let calls_in_destructor = Rc::clone(&calls);
    runtime.register_handle_destructor(WIDGET_KIND, move |_ptr| {
        *calls_in_destructor.borrow_mut() += 1;
    });

    let ptr = runtime.heap_mut().allocate(16, 8, TypeId(99));
    let handle = TypedHandle {
        generation: 1,
        kind: WIDGET_KIND,
        id: 2,
    };
    runtime.intern_handle(handle, OwnershipMode::EngineOwned, ptr);

    runtime.collect_minor();
    assert_eq!(*calls.borrow(), 0);
    assert_eq!(runtime.lookup_handle(handle), Some(ptr));
}
