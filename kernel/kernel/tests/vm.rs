//! Address-space lifecycle and range-allocator behavior through the full
//! memory context.

mod common;

use kernel_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_info::{KERNEL_STACK_SIZE, USER_RANGE_BASE};
use kernel_paging::{MapFlags, TableWindows};
use kernel_ranges::RangeAllocError;

#[test]
fn fork_style_clone_preserves_user_memory() {
    let ctx = common::machine(2048);
    let free_at_boot = ctx.frame_stats().free_bytes;

    let parent = ctx.create_process_space().unwrap();
    let code_va = VirtualAddress::new(USER_RANGE_BASE);
    let shared_va = VirtualAddress::new(USER_RANGE_BASE + 0x40_0000);

    ctx.with_frames(|frames| {
        parent.map_to_free_frames(
            frames,
            ctx.windows(),
            code_va,
            2 * PAGE_SIZE,
            MapFlags::WRITABLE | MapFlags::USER,
        )
    })
    .unwrap();
    ctx.with_frames(|frames| {
        parent.map_to_free_frames(
            frames,
            ctx.windows(),
            shared_va,
            PAGE_SIZE,
            MapFlags::WRITABLE | MapFlags::USER | MapFlags::SHARED,
        )
    })
    .unwrap();

    let code_pa = parent.virtual_to_physical(ctx.windows(), code_va);
    let shared_pa = parent.virtual_to_physical(ctx.windows(), shared_va);
    ctx.windows()
        .with_frame(code_pa.page(), |b| b[..8].copy_from_slice(b"mov eax,"));
    ctx.windows()
        .with_frame(shared_pa.page(), |b| b[..6].copy_from_slice(b"shmbuf"));

    let child = ctx.clone_process_space(&parent).unwrap();

    let child_code = child.virtual_to_physical(ctx.windows(), code_va);
    assert_ne!(child_code, code_pa, "private pages are copied");
    ctx.windows()
        .with_frame(child_code.page(), |b| assert_eq!(&b[..8], b"mov eax,"));

    let child_shared = child.virtual_to_physical(ctx.windows(), shared_va);
    assert_eq!(child_shared, shared_pa, "shared pages alias");
    assert_eq!(
        ctx.with_frames(|f| f.refcount_of(shared_pa.page()).get()),
        2,
    );

    ctx.destroy_process_space(child);
    ctx.destroy_process_space(parent);
    assert_eq!(
        ctx.frame_stats().free_bytes,
        free_at_boot,
        "all process memory returned",
    );
}

#[test]
fn kernel_range_round_trip_and_coalescing() {
    let ctx = common::machine(1024);
    let before = ctx.kernel_range_free_bytes();

    let a = ctx.allocate_kernel_range(2 * PAGE_SIZE).unwrap();
    let b = ctx.allocate_kernel_range(3 * PAGE_SIZE).unwrap();
    assert_eq!(b - a, 2 * PAGE_SIZE, "first fit packs from the bottom");
    assert_eq!(ctx.kernel_range_free_bytes(), before - 5 * PAGE_SIZE);

    ctx.free_kernel_range(a, 2 * PAGE_SIZE).unwrap();
    ctx.free_kernel_range(b, 3 * PAGE_SIZE).unwrap();
    assert_eq!(ctx.kernel_range_free_bytes(), before);

    // the coalesced window serves a maximal allocation again
    let all = ctx.allocate_kernel_range(before).unwrap();
    ctx.free_kernel_range(all, before).unwrap();
}

#[test]
fn kernel_range_rejects_spans_outside_the_window() {
    let ctx = common::machine(1024);
    assert_eq!(
        ctx.free_kernel_range(VirtualAddress::new(0x1000), PAGE_SIZE),
        Err(RangeAllocError::InvalidArgument),
    );
}

#[test]
fn user_range_allocator_lives_inside_the_process_space() {
    let ctx = common::machine(2048);

    let space = ctx.create_process_space().unwrap();
    let mut ranges = ctx.new_user_ranges(&space).unwrap();

    // the initial free-list node occupies the first user page, mapped
    // through the process's own tables
    let node_pa = space.translate(ctx.windows(), VirtualAddress::new(USER_RANGE_BASE));
    assert!(node_pa.is_some(), "range node not mapped in the user space");
    assert!(
        ctx.kernel_space()
            .translate(ctx.windows(), VirtualAddress::new(USER_RANGE_BASE))
            .is_none(),
        "user node must not leak into the kernel space",
    );

    {
        let mut pager = ctx.pager_for(&space, true);
        let mmap_base = ranges.alloc(&mut pager, 16 * PAGE_SIZE).unwrap();
        assert_eq!(mmap_base.as_u32(), USER_RANGE_BASE);
        ranges.free(&mut pager, mmap_base, 16 * PAGE_SIZE).unwrap();
    }

    drop(ranges);
    ctx.destroy_process_space(space);
}

#[test]
fn kernel_stacks_come_out_of_the_kernel_window() {
    let ctx = common::machine(1024);
    let frames_before = ctx.frame_stats().free_bytes;
    let range_before = ctx.kernel_range_free_bytes();

    let stack = ctx.allocate_kernel_stack().unwrap();
    assert_eq!(stack.size, KERNEL_STACK_SIZE);
    assert_eq!(stack.top() - stack.base, KERNEL_STACK_SIZE);

    // mapped and writable end to end
    ctx.write_bytes(stack.base, &[0xee; 64]);
    let mut buf = [0u8; 64];
    ctx.read_bytes(stack.base, &mut buf);
    assert_eq!(buf, [0xee; 64]);

    ctx.free_kernel_stack(stack);
    assert_eq!(ctx.frame_stats().free_bytes, frames_before);
    assert_eq!(ctx.kernel_range_free_bytes(), range_before);
}

#[test]
fn frame_stats_reflect_mappings() {
    let ctx = common::machine(1024);
    let before = ctx.frame_stats();

    let va = ctx.allocate_kernel_range(4 * PAGE_SIZE).unwrap();
    ctx.with_frames(|frames| {
        ctx.kernel_space().map_to_free_frames(
            frames,
            ctx.windows(),
            va,
            4 * PAGE_SIZE,
            MapFlags::WRITABLE,
        )
    })
    .unwrap();
    let after = ctx.frame_stats();
    assert_eq!(after.total_bytes, before.total_bytes);
    assert_eq!(before.free_bytes - after.free_bytes, 4 * 4096);

    ctx.with_frames(|frames| {
        ctx.kernel_space()
            .unmap(frames, ctx.windows(), va, 4 * PAGE_SIZE);
    });
    ctx.free_kernel_range(va, 4 * PAGE_SIZE).unwrap();
    assert_eq!(ctx.frame_stats().free_bytes, before.free_bytes);
}
