use std::ptr::NonNull;

use fitloc::ArenaPool;

fn print_alloc(size: usize, addr: NonNull<u8>) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    let mut pool = ArenaPool::new(1024 * 1024, 2).unwrap();

    let addr1 = pool.allocate(1).unwrap();
    print_alloc(1, addr1);

    let addr2 = pool.allocate(1024).unwrap();
    print_alloc(1024, addr2);

    let addr3 = pool.allocate(4096).unwrap();
    print_alloc(4096, addr3);

    unsafe {
        addr2.as_ptr().write_bytes(0x42, 1024);
        println!(
            "First and last byte of the middle allocation: {} {}",
            *addr2.as_ptr(),
            *addr2.as_ptr().add(1023)
        );

        println!("Releasing the middle allocation...");
        pool.release(addr2, 1024).unwrap();

        // Best fit hands the freshly released region right back.
        let addr4 = pool.allocate(1000).unwrap();
        print_alloc(1000, addr4);
        println!("Reused the released region: {}", addr4 == addr2);

        println!("Releasing everything...");
        pool.release(addr1, 1).unwrap();
        pool.release(addr3, 4096).unwrap();
        pool.release(addr4, 1000).unwrap();
    }

    // With the arena fully coalesced, one huge allocation fits again.
    let big = pool.allocate(1024 * 1024 - 128).unwrap();
    print_alloc(1024 * 1024 - 128, big);
    unsafe { pool.release(big, 1024 * 1024 - 128).unwrap() };
}
