//! # Virtual Range Allocator
//!
//! Manages the free spans of a window of virtual address space as an
//! address-ordered, first-fit, coalescing free list.
//!
//! The twist that shapes everything here: each list node lives **inside the
//! free span it describes**, in that span's first page. The allocator can
//! not keep its bookkeeping on a heap, because the kernel heap is built on
//! top of this allocator. So every node insert or removal maps or unmaps
//! one page through the paging manager — reached via the [`NodePager`]
//! seam — and consuming a span from its low end means relocating its node
//! forward. This recursive dependency on the paging layer is intentional.
//!
//! One instance manages the kernel window; each process owns another for
//! its user-space mappings. Instances are not internally locked — the
//! owner wraps them in a mutex.

#![cfg_attr(not(any(test, doctest)), no_std)]

use kernel_addresses::{PAGE_SIZE, VirtualAddress};
use log::trace;

/// Errors from range allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RangeAllocError {
    /// No free span is large enough.
    #[error("out of virtual address space")]
    OutOfAddressSpace,

    /// Span is outside the managed window, misaligned, or empty.
    #[error("invalid range argument")]
    InvalidArgument,

    /// The paging manager could not back a free-list node page.
    #[error("out of physical memory while placing a free-list node")]
    OutOfMemory,
}

/// Header of one free span, stored in the span's first page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RangeNode {
    /// Span length in bytes, always a page multiple.
    pub len: u32,
    /// Next free span in address order.
    pub next: Option<VirtualAddress>,
}

/// How the allocator reaches its embedded nodes.
///
/// `map_node` backs one page at `va` so a node can live there; `unmap_node`
/// releases it. Reads and writes are only legal between the two — the
/// kernel implementation goes through the paging manager, and the test
/// implementation asserts the discipline.
pub trait NodePager {
    /// Back the page at `va` with a fresh frame for node storage.
    ///
    /// # Errors
    /// [`RangeAllocError::OutOfMemory`] when no frame is available.
    fn map_node(&mut self, va: VirtualAddress) -> Result<(), RangeAllocError>;

    /// Release the node page at `va`.
    fn unmap_node(&mut self, va: VirtualAddress);

    /// Read the node stored at `va`. Must currently be mapped.
    fn read_node(&self, va: VirtualAddress) -> RangeNode;

    /// Write the node stored at `va`. Must currently be mapped.
    fn write_node(&mut self, va: VirtualAddress, node: RangeNode);
}

/// First-fit allocator over `[base, end)`.
pub struct RangeAllocator {
    base: VirtualAddress,
    end: VirtualAddress,
    head: Option<VirtualAddress>,
    free_bytes: u32,
}

impl RangeAllocator {
    /// Set up the allocator with one giant free span covering the window.
    ///
    /// # Errors
    /// [`RangeAllocError::InvalidArgument`] for a misaligned or empty
    /// window; [`RangeAllocError::OutOfMemory`] if the initial node page
    /// cannot be backed.
    pub fn new<P: NodePager>(
        pager: &mut P,
        base: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<Self, RangeAllocError> {
        if !base.is_page_aligned() || !end.is_page_aligned() || end <= base {
            return Err(RangeAllocError::InvalidArgument);
        }
        pager.map_node(base)?;
        pager.write_node(
            base,
            RangeNode {
                len: end - base,
                next: None,
            },
        );
        Ok(Self {
            base,
            end,
            head: Some(base),
            free_bytes: end - base,
        })
    }

    /// Reserve `size` bytes (rounded up to a page multiple), first-fit,
    /// consumed from the low end of the chosen span.
    ///
    /// # Errors
    /// [`RangeAllocError::OutOfAddressSpace`] when no span fits;
    /// [`RangeAllocError::InvalidArgument`] for a zero size;
    /// [`RangeAllocError::OutOfMemory`] if the shrunken span's relocated
    /// node cannot be backed (the allocator is left unchanged).
    pub fn alloc<P: NodePager>(
        &mut self,
        pager: &mut P,
        size: u32,
    ) -> Result<VirtualAddress, RangeAllocError> {
        let size = round_to_pages(size)?;

        let mut prev: Option<VirtualAddress> = None;
        let mut cursor = self.head;
        loop {
            let Some(node_va) = cursor else {
                return Err(RangeAllocError::OutOfAddressSpace);
            };
            let node = pager.read_node(node_va);
            if node.len < size {
                prev = Some(node_va);
                cursor = node.next;
                continue;
            }

            let successor = if node.len == size {
                node.next
            } else {
                // Shrink from the low end: the node moves forward.
                let moved = node_va + size;
                pager.map_node(moved)?;
                pager.write_node(
                    moved,
                    RangeNode {
                        len: node.len - size,
                        next: node.next,
                    },
                );
                Some(moved)
            };
            self.relink(pager, prev, successor);
            pager.unmap_node(node_va);
            self.free_bytes -= size;
            trace!("range alloc {size:#x} bytes at {node_va}");
            return Ok(node_va);
        }
    }

    /// Return `[addr, addr + size)` to the free list, coalescing with the
    /// neighboring spans when contiguous.
    ///
    /// # Errors
    /// [`RangeAllocError::InvalidArgument`] if the span falls outside the
    /// managed window or is misaligned.
    ///
    /// # Panics
    /// Freeing a span that overlaps an already-free span is a double free
    /// and panics.
    pub fn free<P: NodePager>(
        &mut self,
        pager: &mut P,
        addr: VirtualAddress,
        size: u32,
    ) -> Result<(), RangeAllocError> {
        let size = round_to_pages(size)?;
        if !addr.is_page_aligned()
            || addr < self.base
            || addr.as_u32().checked_add(size).is_none_or(|e| e > self.end.as_u32())
        {
            return Err(RangeAllocError::InvalidArgument);
        }

        // Locate the free spans on either side of the span being freed.
        let mut prev: Option<VirtualAddress> = None;
        let mut cursor = self.head;
        while let Some(node_va) = cursor {
            if node_va > addr {
                break;
            }
            prev = Some(node_va);
            cursor = pager.read_node(node_va).next;
        }
        let next = cursor;

        if let Some(prev_va) = prev {
            let prev_node = pager.read_node(prev_va);
            assert!(
                prev_va + prev_node.len <= addr,
                "double free: {addr} overlaps free span at {prev_va}",
            );
        }
        if let Some(next_va) = next {
            assert!(
                addr + size <= next_va,
                "double free: {addr} overlaps free span at {next_va}",
            );
        }

        let adjacent_prev = prev.filter(|&p| p + pager.read_node(p).len == addr);
        let adjacent_next = next.filter(|&n| addr + size == n);

        match (adjacent_prev, adjacent_next) {
            (Some(prev_va), Some(next_va)) => {
                let next_node = pager.read_node(next_va);
                let mut prev_node = pager.read_node(prev_va);
                prev_node.len += size + next_node.len;
                prev_node.next = next_node.next;
                pager.write_node(prev_va, prev_node);
                pager.unmap_node(next_va);
            }
            (Some(prev_va), None) => {
                let mut prev_node = pager.read_node(prev_va);
                prev_node.len += size;
                pager.write_node(prev_va, prev_node);
            }
            (None, Some(next_va)) => {
                let next_node = pager.read_node(next_va);
                pager.map_node(addr)?;
                pager.write_node(
                    addr,
                    RangeNode {
                        len: size + next_node.len,
                        next: next_node.next,
                    },
                );
                self.relink(pager, prev, Some(addr));
                pager.unmap_node(next_va);
            }
            (None, None) => {
                pager.map_node(addr)?;
                pager.write_node(addr, RangeNode { len: size, next });
                self.relink(pager, prev, Some(addr));
            }
        }

        self.free_bytes += size;
        trace!("range free {size:#x} bytes at {addr}");
        Ok(())
    }

    /// Point `prev` (or the list head) at `target`.
    fn relink<P: NodePager>(
        &mut self,
        pager: &mut P,
        prev: Option<VirtualAddress>,
        target: Option<VirtualAddress>,
    ) {
        match prev {
            None => self.head = target,
            Some(prev_va) => {
                let mut prev_node = pager.read_node(prev_va);
                prev_node.next = target;
                pager.write_node(prev_va, prev_node);
            }
        }
    }

    #[must_use]
    pub const fn free_bytes(&self) -> u32 {
        self.free_bytes
    }

    #[must_use]
    pub const fn window(&self) -> (VirtualAddress, VirtualAddress) {
        (self.base, self.end)
    }

    /// Number of free spans; walks the list.
    #[must_use]
    pub fn span_count<P: NodePager>(&self, pager: &P) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(node_va) = cursor {
            count += 1;
            cursor = pager.read_node(node_va).next;
        }
        count
    }

    /// Visit every free span in address order.
    pub fn spans<P: NodePager>(&self, pager: &P, mut visit: impl FnMut(VirtualAddress, u32)) {
        let mut cursor = self.head;
        while let Some(node_va) = cursor {
            let node = pager.read_node(node_va);
            visit(node_va, node.len);
            cursor = node.next;
        }
    }
}

fn round_to_pages(size: u32) -> Result<u32, RangeAllocError> {
    if size == 0 {
        return Err(RangeAllocError::InvalidArgument);
    }
    size.checked_add(PAGE_SIZE - 1)
        .map(|s| s & !(PAGE_SIZE - 1))
        .ok_or(RangeAllocError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    /// Fake pager: stores nodes in a map and enforces the discipline that
    /// nodes are only read or written while their page is mapped.
    #[derive(Default)]
    struct MapPager {
        nodes: HashMap<u32, RangeNode>,
        mapped: HashSet<u32>,
        fail_maps: bool,
    }

    impl NodePager for MapPager {
        fn map_node(&mut self, va: VirtualAddress) -> Result<(), RangeAllocError> {
            if self.fail_maps {
                return Err(RangeAllocError::OutOfMemory);
            }
            assert!(self.mapped.insert(va.as_u32()), "node page double-mapped");
            Ok(())
        }

        fn unmap_node(&mut self, va: VirtualAddress) {
            assert!(self.mapped.remove(&va.as_u32()), "unmapping unmapped node");
            self.nodes.remove(&va.as_u32());
        }

        fn read_node(&self, va: VirtualAddress) -> RangeNode {
            assert!(self.mapped.contains(&va.as_u32()), "reading unmapped node");
            self.nodes[&va.as_u32()]
        }

        fn write_node(&mut self, va: VirtualAddress, node: RangeNode) {
            assert!(self.mapped.contains(&va.as_u32()), "writing unmapped node");
            self.nodes.insert(va.as_u32(), node);
        }
    }

    const BASE: u32 = 0xc800_0000;
    const WINDOW: u32 = 64 * PAGE_SIZE;

    fn allocator(pager: &mut MapPager) -> RangeAllocator {
        RangeAllocator::new(
            pager,
            VirtualAddress::new(BASE),
            VirtualAddress::new(BASE + WINDOW),
        )
        .unwrap()
    }

    #[test]
    fn alloc_free_round_trip_restores_the_window() {
        let mut pager = MapPager::default();
        let mut ranges = allocator(&mut pager);
        let before = ranges.free_bytes();

        let addr = ranges.alloc(&mut pager, 3 * PAGE_SIZE).unwrap();
        assert_eq!(ranges.free_bytes(), before - 3 * PAGE_SIZE);

        ranges.free(&mut pager, addr, 3 * PAGE_SIZE).unwrap();
        assert_eq!(ranges.free_bytes(), before);
        assert_eq!(ranges.span_count(&pager), 1);
        assert_eq!(pager.mapped.len(), 1, "one node page per span");
    }

    #[test]
    fn first_fit_consumes_from_the_low_end() {
        let mut pager = MapPager::default();
        let mut ranges = allocator(&mut pager);

        let a = ranges.alloc(&mut pager, 2 * PAGE_SIZE).unwrap();
        let b = ranges.alloc(&mut pager, PAGE_SIZE).unwrap();
        assert_eq!(a.as_u32(), BASE);
        assert_eq!(b.as_u32(), BASE + 2 * PAGE_SIZE);
    }

    #[test]
    fn sizes_round_up_to_page_multiples() {
        let mut pager = MapPager::default();
        let mut ranges = allocator(&mut pager);

        let before = ranges.free_bytes();
        let addr = ranges.alloc(&mut pager, 1).unwrap();
        assert_eq!(ranges.free_bytes(), before - PAGE_SIZE);
        ranges.free(&mut pager, addr, 100).unwrap();
        assert_eq!(ranges.free_bytes(), before);
    }

    #[test]
    fn freeing_adjacent_spans_merges_nodes() {
        let mut pager = MapPager::default();
        let mut ranges = allocator(&mut pager);

        let a = ranges.alloc(&mut pager, 2 * PAGE_SIZE).unwrap();
        let b = ranges.alloc(&mut pager, 3 * PAGE_SIZE).unwrap();
        let c = ranges.alloc(&mut pager, PAGE_SIZE).unwrap();
        assert_eq!(ranges.span_count(&pager), 1, "tail span only");

        // a and c first: three disjoint spans (a, c, tail)
        ranges.free(&mut pager, a, 2 * PAGE_SIZE).unwrap();
        ranges.free(&mut pager, c, PAGE_SIZE).unwrap();
        assert_eq!(ranges.span_count(&pager), 2, "c merged with the tail");

        // b bridges a and c+tail: everything collapses to one span
        ranges.free(&mut pager, b, 3 * PAGE_SIZE).unwrap();
        assert_eq!(ranges.span_count(&pager), 1);
        let mut seen = Vec::new();
        ranges.spans(&pager, |va, len| seen.push((va.as_u32(), len)));
        assert_eq!(seen, vec![(BASE, WINDOW)]);
    }

    #[test]
    fn exhausting_the_window_reports_out_of_address_space() {
        let mut pager = MapPager::default();
        let mut ranges = allocator(&mut pager);

        let all = ranges.alloc(&mut pager, WINDOW).unwrap();
        assert_eq!(ranges.free_bytes(), 0);
        assert_eq!(ranges.span_count(&pager), 0);
        assert_eq!(
            ranges.alloc(&mut pager, PAGE_SIZE),
            Err(RangeAllocError::OutOfAddressSpace),
        );

        ranges.free(&mut pager, all, WINDOW).unwrap();
        assert_eq!(ranges.free_bytes(), WINDOW);
    }

    #[test]
    fn oversized_requests_are_out_of_address_space() {
        let mut pager = MapPager::default();
        let mut ranges = allocator(&mut pager);
        assert_eq!(
            ranges.alloc(&mut pager, WINDOW + PAGE_SIZE),
            Err(RangeAllocError::OutOfAddressSpace),
        );
    }

    #[test]
    fn invalid_spans_are_rejected() {
        let mut pager = MapPager::default();
        let mut ranges = allocator(&mut pager);

        assert_eq!(
            ranges.alloc(&mut pager, 0),
            Err(RangeAllocError::InvalidArgument),
        );
        // below the window
        assert_eq!(
            ranges.free(&mut pager, VirtualAddress::new(BASE - PAGE_SIZE), PAGE_SIZE),
            Err(RangeAllocError::InvalidArgument),
        );
        // beyond the window
        assert_eq!(
            ranges.free(&mut pager, VirtualAddress::new(BASE + WINDOW), PAGE_SIZE),
            Err(RangeAllocError::InvalidArgument),
        );
        // misaligned base
        assert_eq!(
            ranges.free(&mut pager, VirtualAddress::new(BASE + 123), PAGE_SIZE),
            Err(RangeAllocError::InvalidArgument),
        );
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn overlapping_free_is_fatal() {
        let mut pager = MapPager::default();
        let mut ranges = allocator(&mut pager);

        let addr = ranges.alloc(&mut pager, 2 * PAGE_SIZE).unwrap();
        ranges.free(&mut pager, addr, 2 * PAGE_SIZE).unwrap();
        let _ = ranges.free(&mut pager, addr + PAGE_SIZE, PAGE_SIZE);
    }

    #[test]
    fn node_relocation_failure_leaves_the_allocator_intact() {
        let mut pager = MapPager::default();
        let mut ranges = allocator(&mut pager);
        let before = ranges.free_bytes();

        pager.fail_maps = true;
        assert_eq!(
            ranges.alloc(&mut pager, PAGE_SIZE),
            Err(RangeAllocError::OutOfMemory),
        );
        pager.fail_maps = false;

        assert_eq!(ranges.free_bytes(), before);
        assert_eq!(ranges.span_count(&pager), 1);
        // and the allocator still works
        ranges.alloc(&mut pager, PAGE_SIZE).unwrap();
    }

    #[test]
    fn node_pages_track_spans_exactly() {
        let mut pager = MapPager::default();
        let mut ranges = allocator(&mut pager);

        let a = ranges.alloc(&mut pager, PAGE_SIZE).unwrap();
        let b = ranges.alloc(&mut pager, PAGE_SIZE).unwrap();
        let _c = ranges.alloc(&mut pager, PAGE_SIZE).unwrap();
        ranges.free(&mut pager, a, PAGE_SIZE).unwrap();
        ranges.free(&mut pager, b, PAGE_SIZE).unwrap();

        assert_eq!(pager.mapped.len(), ranges.span_count(&pager));
    }
}
