use std::{
    cell::RefCell,
    rc::Rc,
    sync::Arc,
};

use crate::{
    block::BlockState,
    globals::{BLOCK_SIZE, GRANULES_IN_BLOCK, LARGE_BLOCK_SIZE, LINE_COUNT, SWEEP_BATCH_SIZE},
    heap::Heap,
    object::{read_word, write_word, TypeInfo},
    object_meta::GranuleState,
    space::Space,
    statistics::{EventLog, GcEvent, NoopRecorder},
    sweeper, Config,
};

static PAIR: TypeInfo = TypeInfo::plain(1, "Pair", &[1, 2]);
static BYTES: TypeInfo = TypeInfo::value_array(2, "Bytes");

type Roots = Rc<RefCell<Vec<usize>>>;

fn config(blocks: usize) -> Config {
    Config {
        min_heap_size: blocks * BLOCK_SIZE,
        max_heap_size: blocks * BLOCK_SIZE,
        gc_threads: 2,
        ..Config::default()
    }
}

fn rooted_heap(config: Config) -> (Heap, Roots) {
    let mut heap = Heap::try_new(config, Arc::new(NoopRecorder)).unwrap();
    let roots: Roots = Rc::new(RefCell::new(Vec::new()));
    let shadow = roots.clone();
    heap.add_constraint(move |visitor| {
        for &root in shadow.borrow().iter() {
            visitor.visit_precise(root);
        }
    });
    (heap, roots)
}

fn assert_census_consistent(heap: &mut Heap) {
    let census = heap.block_census();
    assert_eq!(census.marked, 0, "{:?}", census);
    assert_eq!(
        census.free + census.recyclable + census.in_use,
        census.total,
        "{:?}",
        census
    );
    assert_eq!(census.free, heap.space().block_allocator.free_block_count());
}

#[test]
fn small_objects_get_granule_state_and_type() {
    let (mut heap, _roots) = rooted_heap(config(64));
    let a = heap.allocate_small(&PAIR, 24) as usize;
    let b = heap.allocate_small(&PAIR, 24) as usize;
    assert_eq!(b - a, 32);
    let space = heap.space();
    assert_eq!(space.granules.state(space.granule_index(a)), GranuleState::Allocated);
    assert_eq!(space.granules.state(space.granule_index(a) + 1), GranuleState::Placeholder);
    assert_eq!(unsafe { read_word(a, 0) }, &PAIR as *const TypeInfo as usize);
    assert_eq!(space.object_size(a), 32);
    assert_eq!(space.find_object(a + 20), Some(a));
    assert!(space.is_object_head(b));
    assert!(!space.is_object_head(a + 16));
}

#[test]
fn census_adds_up_after_collections() {
    let (mut heap, roots) = rooted_heap(config(64));
    for round in 0..4 {
        for i in 0..2000 {
            let object = heap.allocate_small(&PAIR, 16 + (i % 7) * 16) as usize;
            if i % 5 == round {
                roots.borrow_mut().push(object);
            }
        }
        heap.collect();
        assert_census_consistent(&mut heap);
    }
}

#[test]
fn reused_memory_is_zeroed() {
    let (mut heap, _roots) = rooted_heap(config(32));
    let mut objects = Vec::new();
    for _ in 0..1000 {
        let object = heap.allocate_small(&BYTES, 128);
        unsafe {
            std::ptr::write_bytes(object.add(8), 0xAB, 120);
        }
        objects.push(object as usize);
    }
    heap.collect();
    heap.finish_sweep();
    for _ in 0..1000 {
        let object = heap.allocate_small(&BYTES, 128) as usize;
        for word in 1..16 {
            assert_eq!(unsafe { read_word(object, word) }, 0);
        }
    }
}

#[test]
fn marked_lines_survive_and_dead_lines_recycle() {
    let (mut heap, roots) = rooted_heap(config(32));
    let mut objects = Vec::new();
    for _ in 0..LINE_COUNT * 16 {
        objects.push(heap.allocate_small(&PAIR, 16) as usize);
    }
    // keep one object per line of the first block
    let first = objects[0];
    let keep: Vec<usize> = objects
        .iter()
        .copied()
        .filter(|&o| o - first < BLOCK_SIZE && (o - first) % 1024 == 0)
        .collect();
    roots.borrow_mut().extend(keep.iter().copied());
    heap.collect();
    heap.finish_sweep();

    let space = heap.space();
    let block = space.block_index(first);
    match space.block(block).state() {
        BlockState::Simple {
            first_free_line: Some(_),
        } => {}
        state => panic!("unexpected state {:?}", state),
    }
    for &object in &keep {
        assert!(space.is_object_head(object));
    }
    assert!(space.find_object(first + 16).is_none());
    assert_census_consistent(&mut heap);
}

#[test]
fn reachable_graph_survives_repeated_collections() {
    let (mut heap, roots) = rooted_heap(config(64));
    let mut list = 0usize;
    for i in 0..5000usize {
        let node = heap.allocate_small(&PAIR, 24);
        unsafe {
            write_word(node, 1, list);
            write_word(node, 3, i);
        }
        list = node as usize;
        roots.borrow_mut().clear();
        roots.borrow_mut().push(list);
        // garbage in between
        heap.allocate_small(&BYTES, 48);
    }
    for _ in 0..3 {
        heap.collect();
    }
    let mut count = 0;
    let mut node = list;
    while node != 0 {
        assert!(heap.space().is_object_head(node));
        assert_eq!(unsafe { read_word(node, 3) }, 4999 - count);
        count += 1;
        node = unsafe { read_word(node, 1) };
    }
    assert_eq!(count, 5000);
    assert_census_consistent(&mut heap);
}

#[test]
fn exhaustion_collects_instead_of_growing() {
    let (mut heap, _roots) = rooted_heap(config(32));
    // ten times the heap in garbage
    for _ in 0..10 * 32 * 128 {
        heap.allocate_small(&BYTES, 256);
    }
    let stats = heap.statistics();
    assert!(stats.total_gc_cycles_count >= 9);
    assert_eq!(stats.block_count, 32);
    assert_census_consistent(&mut heap);
}

#[test]
fn everything_is_reclaimed_without_roots() {
    let (mut heap, _roots) = rooted_heap(config(32));
    let objects_per_block = BLOCK_SIZE / 256;
    for _ in 0..30 * objects_per_block {
        heap.allocate_small(&BYTES, 256);
    }
    assert_eq!(heap.statistics().total_gc_cycles_count, 0);
    heap.collect();
    let census = heap.block_census();
    assert_eq!(census.free, census.total);
    for _ in 0..30 * objects_per_block {
        heap.allocate_small(&BYTES, 256);
    }
    assert_eq!(heap.statistics().total_gc_cycles_count, 1);
}

#[test]
fn superblock_returns_its_blocks() {
    let (mut heap, roots) = rooted_heap(config(32));
    let total = heap.statistics().free_blocks;
    let object = heap.allocate_large(&BYTES, 3 * BLOCK_SIZE) as usize;
    let space = heap.space();
    let first = space.block_index(object);
    assert_eq!(space.block(first).state(), BlockState::SuperblockStart { len: 3 });
    assert_eq!(space.object_size(object), 3 * BLOCK_SIZE);
    assert_eq!(space.find_object(object + 2 * BLOCK_SIZE + 100), Some(object));
    assert_eq!(heap.statistics().free_blocks, total - 3);

    roots.borrow_mut().push(object);
    heap.collect();
    heap.finish_sweep();
    assert!(heap.space().is_object_head(object));
    assert_eq!(heap.statistics().free_blocks, total - 3);

    roots.borrow_mut().clear();
    heap.collect();
    heap.finish_sweep();
    assert!(!heap.space().is_object_head(object));
    assert_eq!(heap.statistics().free_blocks, total);
    assert_census_consistent(&mut heap);
}

#[test]
fn live_large_object_gives_back_its_tail() {
    let (mut heap, roots) = rooted_heap(config(32));
    let a = heap.allocate_large(&BYTES, LARGE_BLOCK_SIZE) as usize;
    let b = heap.allocate_large(&BYTES, 2 * LARGE_BLOCK_SIZE) as usize;
    assert_eq!(b, a + LARGE_BLOCK_SIZE);
    roots.borrow_mut().push(b);
    heap.collect();
    heap.finish_sweep();
    let space = heap.space();
    assert!(!space.is_object_head(a));
    assert!(space.is_object_head(b));
    assert_eq!(space.large.free_chunk_count(), 2);
    // both free chunks are handed out again before a new superblock
    let c = heap.allocate_large(&BYTES, LARGE_BLOCK_SIZE) as usize;
    assert!(c == a || c == b + 2 * LARGE_BLOCK_SIZE);
}

#[test]
fn freed_runs_coalesce_across_batches() {
    let (mut heap, _roots) = rooted_heap(config(32));
    for _ in 0..30 * 128 {
        heap.allocate_small(&BYTES, 256);
    }
    heap.collect();
    heap.finish_sweep();
    let object = heap.allocate_large(&BYTES, 30 * BLOCK_SIZE) as usize;
    assert_eq!(heap.statistics().total_gc_cycles_count, 1);
    assert_eq!(heap.statistics().block_count, 32);
    assert_eq!(heap.space().object_size(object), 30 * BLOCK_SIZE);
}

#[test]
fn conservative_roots_keep_interior_pointers() {
    let mut heap = Heap::try_new(config(32), Arc::new(NoopRecorder)).unwrap();
    let object = heap.allocate_small(&PAIR, 64) as usize;
    let child = heap.allocate_small(&PAIR, 16) as usize;
    let garbage = heap.allocate_small(&PAIR, 16) as usize;
    unsafe {
        write_word(object as *mut u8, 2, child);
    }
    let stack = vec![object + 40, 12345, usize::MAX];
    heap.add_constraint(move |visitor| visitor.visit_words(&stack));
    heap.collect();
    heap.finish_sweep();
    let space = heap.space();
    assert!(space.is_object_head(object));
    assert!(space.is_object_head(child));
    assert!(!space.is_object_head(garbage));
}

#[test]
fn reference_arrays_trace_their_length_only() {
    static ARRAY: TypeInfo = TypeInfo::ref_array(3, "Array");
    let (mut heap, roots) = rooted_heap(config(32));
    let array = heap.allocate_small(&ARRAY, crate::object::array_size(4, 8));
    let children: Vec<usize> = (0..4)
        .map(|_| heap.allocate_small(&PAIR, 16) as usize)
        .collect();
    unsafe {
        crate::object::set_array_length(array, 3);
        for (index, &child) in children.iter().enumerate() {
            write_word(array, 2 + index, child);
        }
    }
    roots.borrow_mut().push(array as usize);
    heap.collect();
    heap.finish_sweep();
    let space = heap.space();
    for &child in &children[..3] {
        assert!(space.is_object_head(child));
    }
    assert!(!space.is_object_head(children[3]));
}

#[test]
fn recorder_sees_every_phase() {
    let log = Arc::new(EventLog::new());
    let mut heap = Heap::try_new(config(32), log.clone()).unwrap();
    heap.allocate_small(&PAIR, 16);
    heap.collect();
    heap.finish_sweep();
    assert_eq!(log.count(GcEvent::Collection), 1);
    assert_eq!(log.count(GcEvent::MarkRoots), 1);
    assert_eq!(log.count(GcEvent::Mark), 1);
    assert!(log.count(GcEvent::SweepBatch) >= 1);
}

#[test]
fn concurrent_batches_account_every_block_once() {
    let config = Config {
        min_heap_size: 256 * BLOCK_SIZE,
        max_heap_size: 256 * BLOCK_SIZE,
        ..Config::default()
    };
    let space = Arc::new(Space::new(&config, 3, Arc::new(NoopRecorder)).unwrap());
    while let Some(block) = space.block_allocator.get_free_block(&space.blocks) {
        space.block(block).set_state(BlockState::Simple {
            first_free_line: None,
        });
    }
    // every fourth block survives with one marked line
    for block in (0..256).step_by(4) {
        space.block(block).set_state(BlockState::Marked);
        space.lines[block as usize * LINE_COUNT].mark();
        let granule = block as usize * GRANULES_IN_BLOCK;
        space.granules.set_allocated(granule, 1);
        assert!(space.granules.try_mark(granule));
    }
    space.block_allocator.clear();
    space.recycled_blocks.clear();
    space.sweep.reset(space.block_count());

    let workers: Vec<_> = (0..4)
        .map(|participant| {
            let space = space.clone();
            std::thread::spawn(move || {
                let batch = if participant == 0 { 4 } else { SWEEP_BATCH_SIZE / 4 };
                while sweeper::sweep(&space, participant, batch) {
                    sweeper::lazy_coalesce(&space);
                }
                while !space.sweep.is_done() {
                    sweeper::lazy_coalesce(&space);
                    std::thread::yield_now();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(space.sweep.is_done());
    assert_eq!(space.recycled_blocks.len(), 64);
    assert_eq!(space.block_allocator.free_block_count(), 192);
    let census = space.block_census();
    assert_eq!(census.free, 192);
    assert_eq!(census.recyclable, 64);
    assert_eq!(census.in_use, 0);
    let mut free = 0;
    while let Some(first) = space.block_allocator.get_free_superblock(&space.blocks, 3) {
        assert_eq!(first % 4, 1);
        free += 3;
    }
    assert_eq!(free, 192);
    assert_eq!(space.sweep.limit(), 256);
    assert!(space.block(0).is_simple());
}

#[test]
fn sizes_rounding_to_a_large_chunk_go_to_the_large_allocator() {
    let (mut heap, _roots) = rooted_heap(config(32));
    let largest_small = LARGE_BLOCK_SIZE - 16;
    let small = heap.allocate(&BYTES, largest_small) as usize;
    assert!(!heap.space().is_large(small));
    assert_eq!(heap.space().object_size(small), largest_small);

    for &size in &[LARGE_BLOCK_SIZE - 15, LARGE_BLOCK_SIZE - 1] {
        let object = heap.allocate(&BYTES, size) as usize;
        assert!(heap.space().is_large(object), "size {}", size);
        assert_eq!(object % LARGE_BLOCK_SIZE, 0);
        assert_eq!(heap.space().object_size(object), LARGE_BLOCK_SIZE);

        let direct = heap.allocate_small(&BYTES, size) as usize;
        assert!(heap.space().is_large(direct), "size {}", size);
        assert!(heap.space().is_object_head(direct));
    }
}
