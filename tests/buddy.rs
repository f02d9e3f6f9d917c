use blockalloc::{Allocator, BuddyAllocator, Region};
use core::alloc::Layout;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type Buddy<'a> = BuddyAllocator<'a, 32, 5>;

#[repr(C, align(32))]
struct Heap([u8; 1024]);
impl Heap {
    fn new() -> Self {
        Self([0; 1024])
    }

    fn region(&mut self) -> Region<'_> {
        Region::new(&mut self.0)
    }
}

/// After all allocations were freed, the chunks have to be recombined into
/// the largest size class.
fn assert_fully_merged(allocator: &Buddy<'_>) {
    for class in 0..4 {
        assert_eq!(allocator.free_chunks(class), 0, "free chunks of class {}", class);
    }
    assert_eq!(allocator.free_chunks(4), 2);
}

#[test]
fn exhausting_with_single_bytes() {
    let mut heap = Heap::new();
    let mut allocator = Buddy::from_region(heap.region()).unwrap();
    assert_eq!(allocator.capacity(), Ok(1024));
    assert_fully_merged(&allocator);

    let layout = Layout::new::<u8>();
    let mut ptrs = Vec::new();
    while let Some(ptr) = allocator.allocate(layout) {
        ptrs.push(ptr);
    }
    assert_eq!(ptrs.len(), 1024 / 32);

    for ptr in ptrs {
        unsafe { allocator.deallocate(ptr) };
    }
    assert_eq!(allocator.capacity(), Ok(1024));
    assert_fully_merged(&allocator);
}

#[test]
fn largest_class_is_the_limit() {
    let mut heap = Heap::new();
    let mut allocator = Buddy::from_region(heap.region()).unwrap();
    // one byte of every chunk holds its class
    assert!(allocator.allocate(Layout::from_size_align(512, 1).unwrap()).is_none());
    let first = allocator.allocate(Layout::from_size_align(511, 1).unwrap()).unwrap();
    let second = allocator.allocate(Layout::from_size_align(511, 32).unwrap()).unwrap();
    assert!(allocator.allocate(Layout::new::<u8>()).is_none());
    assert!(allocator.allocate(Layout::from_size_align(8, 64).unwrap()).is_none());
    unsafe {
        allocator.deallocate(second);
        allocator.deallocate(first);
    }
    assert_fully_merged(&allocator);
}

#[test]
fn random_operations_keep_classes_conserved() {
    for seed in 0..16 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut heap = Heap::new();
        let mut allocator = Buddy::from_region(heap.region()).unwrap();

        let mut live = Vec::new();
        for step in 0..500u32 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..=200);
                let align = 1 << rng.gen_range(0..=5);
                let layout = Layout::from_size_align(size, align).unwrap();
                if let Some(ptr) = allocator.allocate(layout) {
                    assert_eq!(ptr.as_ptr() as usize % align, 0);
                    let usable = allocator.usable_layout(ptr).unwrap().size();
                    assert!(usable >= size);
                    assert_eq!(allocator.allocated_layout(ptr).unwrap().size(), usable + 1);
                    let tag = step as u8;
                    unsafe { ptr.as_ptr().write_bytes(tag, size) };
                    live.push((ptr, size, tag));
                }
            } else {
                let (ptr, size, tag) = live.swap_remove(rng.gen_range(0..live.len()));
                let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
                assert!(bytes.iter().all(|&byte| byte == tag), "allocation was overwritten");
                unsafe { allocator.deallocate(ptr) };
            }
        }
        for (ptr, _, _) in live {
            unsafe { allocator.deallocate(ptr) };
        }
        assert_fully_merged(&allocator);
    }
}
