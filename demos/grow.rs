//! A very minimal example driving a heap by hand through the extender and
//! the classic allocation calls.

use segalloc::{BlockPtr, RawAlloc, ToyHeap};

fn main() {
    env_logger::init();

    let mut allocator = RawAlloc::new(ToyHeap::default());

    unsafe {
        let p = allocator.malloc(100);
        println!("malloc(100)       -> {:p}", p);
        println!(
            "  block size {} (header + payload rounded to alignment)",
            BlockPtr::from_payload(p).size()
        );

        let q = allocator.calloc(4, 25);
        println!("calloc(4, 25)     -> {:p}", q);

        let p = allocator.realloc(p, 300);
        println!("realloc(p, 300)   -> {:p}", p);

        allocator.free(q);
        allocator.free(p);
    }

    let (validity, stats) = allocator.stats();
    println!("valid: {}, stats: {:?}", validity.is_valid(), stats);
    println!("toy heap consumed {} bytes", allocator.extender.size);
}
