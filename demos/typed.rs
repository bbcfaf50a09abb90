use fitloc::Fitloc;

/// A tiny pool-backed scratch buffer that owns its allocator by value. Works
/// because façade clones share one pool.
struct Scratch {
    alloc: Fitloc<u64, { 1024 * 1024 }, 1>,
    data: std::ptr::NonNull<u64>,
    len: usize,
}

fn main() {
    let alloc = Fitloc::<u64, { 1024 * 1024 }, 1>::new().unwrap();

    let len = 1000;
    let scratch = Scratch {
        alloc: alloc.clone(),
        data: alloc.allocate(len).unwrap(),
        len,
    };

    unsafe {
        for i in 0..scratch.len {
            scratch.data.as_ptr().add(i).write(i as u64 * 3);
        }

        let mut sum = 0;
        for i in 0..scratch.len {
            sum += scratch.data.as_ptr().add(i).read();
        }
        println!("Sum of {} stored numbers: {sum}", scratch.len);

        // The clone inside the struct is as good as the original.
        assert_eq!(scratch.alloc, alloc);
        scratch.alloc.release(scratch.data, scratch.len).unwrap();
    }

    println!("Released everything through the clone");
}
