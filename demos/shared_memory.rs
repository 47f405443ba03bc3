//! Builds a linked list inside a named shared memory segment and walks it
//! from a second process, which maps the segment at its own address.
//!
//! `cargo run --example shared_memory` starts the writer, which spawns
//! itself again as the reader.

#[cfg(unix)]
mod demo {
    use std::{cell::RefCell, env, process::Command, ptr::NonNull};

    use relalloc::{
        AllocError, AllocResult, Base, ElementAllocator, FreeListAllocator, PlacementPolicy, RelPtr, SharedMapping,
        StatefulAdapter,
    };

    const SEGMENT_SIZE: usize = 1 << 16;
    /// The root pointer sits in the first bytes of the segment, the arena
    /// starts after it.
    const HEADER: usize = 64;

    #[derive(Clone, Copy)]
    #[repr(C)]
    struct Node {
        value: u64,
        next: RelPtr<Node>,
    }

    fn root(mapping: &SharedMapping) -> *mut RelPtr<Node> {
        mapping.as_ptr().cast()
    }

    fn writer(name: &str) -> AllocResult<()> {
        let mapping = SharedMapping::create(name, SEGMENT_SIZE)?;
        let arena = NonNull::new(unsafe { mapping.as_ptr().add(HEADER) }).ok_or(AllocError::InvalidPointer(HEADER))?;

        let allocator = RefCell::new(unsafe {
            FreeListAllocator::with_external(
                arena,
                SEGMENT_SIZE - HEADER,
                PlacementPolicy::FindFirst,
                false,
                Base::new(mapping.addr()),
            )?
        });
        let nodes = StatefulAdapter::<Node, _>::new(&allocator);

        let mut head = RelPtr::null();
        for value in [2, 3, 5, 7, 11, 13] {
            let node = nodes.allocate(1)?;
            unsafe { nodes.resolve(node).write(Node { value, next: head }) };
            head = node;
        }
        unsafe { root(&mapping).write(head) };

        println!("writer: segment mapped at {:#x}, head at offset {}", mapping.addr(), head.offset());

        let exe = env::current_exe().map_err(|source| AllocError::Os { op: "current_exe", source })?;
        let status = Command::new(exe)
            .args(["reader", name])
            .status()
            .map_err(|source| AllocError::Os { op: "spawn reader", source })?;

        println!("writer: reader exited with {status}");
        Ok(())
    }

    fn reader(name: &str) -> AllocResult<()> {
        let mapping = SharedMapping::open(name, SEGMENT_SIZE)?;
        let base = Base::new(mapping.addr());

        println!("reader: segment mapped at {:#x}", mapping.addr());

        let mut current = unsafe { root(&mapping).read() };
        while !current.is_null() {
            let node = unsafe { current.as_ptr(&base).read() };
            println!("reader: {} at offset {}", node.value, current.offset());
            current = node.next;
        }

        Ok(())
    }

    pub fn run() -> AllocResult<()> {
        let args: Vec<String> = env::args().collect();

        match args.get(1).map(String::as_str) {
            Some("reader") => reader(args.get(2).map_or("", String::as_str)),
            _ => writer(&format!("relalloc-demo-{}", std::process::id())),
        }
    }
}

#[cfg(unix)]
fn main() -> relalloc::AllocResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    demo::run()
}

#[cfg(not(unix))]
fn main() {
    println!("Named shared memory segments are only supported on unix");
}
