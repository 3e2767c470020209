use std::{cell::RefCell, rc::Rc, sync::Arc};

use commix::{
    c_api,
    globals::{BLOCK_SIZE, LARGE_BLOCK_SIZE},
    heap::Heap,
    object::{read_word, write_word, TypeInfo},
    statistics::{EventLog, GcEvent},
    visitor::RootVisitor,
    Config,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

static PAIR: TypeInfo = TypeInfo::plain(1, "Pair", &[1, 2]);
static BYTES: TypeInfo = TypeInfo::value_array(2, "Bytes");

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn shadow_stack(heap: &mut Heap) -> Rc<RefCell<Vec<usize>>> {
    let roots = Rc::new(RefCell::new(Vec::new()));
    let shadow = roots.clone();
    heap.add_constraint(move |visitor| {
        for &root in shadow.borrow().iter() {
            visitor.visit_precise(root);
        }
    });
    roots
}

#[test]
fn random_mix_keeps_rooted_objects() {
    init_logging();
    let mut heap = Heap::try_new(
        Config {
            min_heap_size: 4 << 20,
            max_heap_size: 64 << 20,
            gc_threads: 3,
            ..Config::default()
        },
        Arc::new(EventLog::new()),
    )
    .unwrap();
    let roots = shadow_stack(&mut heap);
    let mut tags = Vec::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for i in 0..20_000usize {
        let size = if rng.gen_ratio(1, 50) {
            rng.gen_range(LARGE_BLOCK_SIZE..4 * BLOCK_SIZE)
        } else {
            rng.gen_range(16..2048)
        };
        let object = heap.allocate(&BYTES, size) as usize;
        assert_eq!(object % 16, 0);
        assert!(heap.space().object_size(object) >= size);
        unsafe {
            write_word(object as *mut u8, 1, i);
        }
        if i % 10 == 0 {
            roots.borrow_mut().push(object);
            tags.push(i);
        }
        if tags.len() > 200 {
            let victim = rng.gen_range(0..tags.len());
            roots.borrow_mut().swap_remove(victim);
            tags.swap_remove(victim);
        }
        if i % 2500 == 0 {
            heap.collect();
        }
    }
    heap.collect();

    for (&object, &tag) in roots.borrow().iter().zip(tags.iter()) {
        assert!(heap.space().is_object_head(object));
        assert_eq!(unsafe { read_word(object, 1) }, tag);
    }
    let census = heap.block_census();
    assert_eq!(census.marked, 0);
    assert_eq!(census.free + census.recyclable + census.in_use, census.total);
}

#[test]
fn heap_grows_under_live_pressure() {
    init_logging();
    let mut heap = Heap::new(Config {
        min_heap_size: 32 * BLOCK_SIZE,
        max_heap_size: 256 * BLOCK_SIZE,
        gc_threads: 2,
        ..Config::default()
    });
    let roots = shadow_stack(&mut heap);
    let mut list = 0usize;
    for i in 0..40_000usize {
        let node = heap.allocate(&PAIR, 40);
        unsafe {
            write_word(node, 1, list);
            write_word(node, 3, i);
        }
        list = node as usize;
        let mut shadow = roots.borrow_mut();
        shadow.clear();
        shadow.push(list);
    }

    let stats = heap.statistics();
    assert!(stats.block_count > 32, "heap did not grow: {}", stats.block_count);
    assert!(stats.block_count <= 256);
    assert_eq!(stats.total_objects_allocated, 40_000);

    let mut expected = 40_000;
    let mut node = list;
    while node != 0 {
        expected -= 1;
        assert_eq!(unsafe { read_word(node, 3) }, expected);
        node = unsafe { read_word(node, 1) };
    }
    assert_eq!(expected, 0);
}

#[test]
fn recorder_times_are_ordered() {
    let log = Arc::new(EventLog::new());
    let mut heap = Heap::try_new(
        Config {
            max_heap_size: 64 << 20,
            gc_threads: 1,
            ..Config::default()
        },
        log.clone(),
    )
    .unwrap();
    for _ in 0..1000 {
        heap.allocate(&PAIR, 32);
    }
    heap.collect();
    heap.finish_sweep();
    for (event, start, end) in log.events() {
        assert!(start <= end, "{:?} ends before it starts", event);
    }
    assert_eq!(log.count(GcEvent::Collection), 1);
}

extern "C" fn report_slot(data: *mut u8, visitor: *mut RootVisitor) {
    unsafe {
        let slot = *(data as *const usize);
        c_api::commix_trace_precise(visitor, slot);
    }
}

#[test]
fn c_api_round_trip() {
    let mut config = c_api::commix_default_config();
    config.min_heap_size = 32 * BLOCK_SIZE;
    config.max_heap_size = 32 * BLOCK_SIZE;
    config.gc_threads = 1;
    let mut slot = Box::new(0usize);
    unsafe {
        let heap = c_api::commix_heap_create(config);
        c_api::commix_add_root_constraint(heap, &mut *slot as *mut usize as *mut u8, report_slot);

        let kept = c_api::commix_allocate_small(heap, &PAIR, 24);
        let big = c_api::commix_allocate_large(heap, &BYTES, LARGE_BLOCK_SIZE);
        c_api::commix_write_barrier(heap, kept);
        write_word(kept, 1, big as usize);
        *slot = kept as usize;
        let dropped = c_api::commix_allocate_small(heap, &PAIR, 24) as usize;

        c_api::commix_collect(heap);
        (*heap).finish_sweep();
        assert!((*heap).space().is_object_head(kept as usize));
        assert!((*heap).space().is_object_head(big as usize));
        assert!(!(*heap).space().is_object_head(dropped));

        c_api::commix_heap_free(heap);
    }
}
