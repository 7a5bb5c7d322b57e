/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of IBFS.
 *
 * IBFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * IBFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * IBFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! File block map.
//!
//! The file block map (FBM) of a resource is the chain of index blocks
//! reached by following `next` pointers from its head: the head first, then
//! zero or more links. The concatenation of their address arrays enumerates
//! the resource's data blocks in order.
//!
//! Mutations follow a leak-over-dangle discipline: a fresh link block is
//! persisted *before* the pointer that makes it reachable, and an address is
//! returned to the allocator only once nothing on disk references it. When a
//! mutation fails halfway, the map latches the error and refuses further
//! mutations; the worst possible damage is a leaked address, recoverable by
//! a full re-scan, never a dangling pointer.

use crate::block::array::AddressArray;
use crate::block::head::Head;
use crate::block::head::ResourceKind;
use crate::block::link::Link;
use crate::block::head_space;
use crate::block::link_space;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::space::AddressSpace;
use crate::volume::Volume;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// One index block of the chain, kept with its address.
#[derive(Debug)]
struct Node {
    /// Address of the block.
    address: u64,
    /// Address of the next link, 0 at the tail.
    next: u64,
    /// The block's address array.
    addrs: AddressArray,
}

/// Metadata updates applied by [`Fbm::set_metadata`].
///
/// Fields left to `None` keep their current value.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetadataUpdate {
    /// New creation timestamp, Unix seconds.
    pub created: Option<u64>,
    /// New modification timestamp, Unix seconds.
    pub modified: Option<u64>,
    /// New resource kind.
    pub resource: Option<ResourceKind>,
}

/// An opened file block map.
#[derive(Debug)]
pub struct Fbm {
    volume: Rc<Volume>,
    space: Rc<RefCell<AddressSpace>>,
    /// The chain: head first, then links in order.
    items: Vec<Node>,
    /// Creation timestamp from the head.
    created: u64,
    /// Modification timestamp from the head.
    modified: u64,
    /// Resource kind from the head.
    resource: ResourceKind,
    /// Latched mutation failure; set once memory and disk may disagree.
    error: Cell<Option<ErrorKind>>,
    /// Address capacity of the head body.
    head_space: usize,
    /// Address capacity of a link body.
    link_space: usize,
}

impl Fbm {
    /// Opens the file block map whose head sits at `address`.
    ///
    /// The whole chain is loaded; a link address seen twice aborts with a
    /// circular-reference error.
    pub fn open(
        volume: Rc<Volume>,
        space: Rc<RefCell<AddressSpace>>,
        address: u64,
    ) -> Result<Self> {
        let head = volume
            .read_head(address)
            .map_err(|e| e.wrap(ErrorKind::FbmOpenFailed))?
            .block;
        let head_cap = head_space(volume.block_size());
        let link_cap = link_space(volume.block_size());

        let mut visited = HashSet::from([address]);
        let mut items = vec![Node {
            address,
            next: head.next,
            addrs: AddressArray::from_body(&head.body, head_cap),
        }];
        let mut next = head.next;
        while next != 0 {
            if !visited.insert(next) {
                return Err(ErrorKind::FbmCircularReference.into());
            }
            let link = volume
                .read_link(next)
                .map_err(|e| e.wrap(ErrorKind::FbmOpenFailed))?
                .block;
            items.push(Node {
                address: next,
                next: link.next,
                addrs: AddressArray::from_body(&link.body, link_cap),
            });
            next = link.next;
        }

        Ok(Self {
            volume,
            space,
            items,
            created: head.created,
            modified: head.modified,
            resource: head.resource,
            error: Cell::new(None),
            head_space: head_cap,
            link_space: link_cap,
        })
    }

    /// Returns the address of the head block.
    pub fn head_address(&self) -> u64 {
        self.items[0].address
    }

    /// Returns the creation timestamp of the resource.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Returns the modification timestamp of the resource.
    pub fn modified(&self) -> u64 {
        self.modified
    }

    /// Returns the resource kind.
    pub fn resource(&self) -> ResourceKind {
        self.resource
    }

    /// Returns the latched mutation failure, if any.
    pub fn latched_error(&self) -> Option<ErrorKind> {
        self.error.get()
    }

    /// Returns the number of data block addresses the map holds.
    pub fn length(&self) -> u64 {
        let n = self.items.len();
        match n {
            1 => self.items[0].addrs.len() as u64,
            _ => {
                self.items[0].addrs.len() as u64
                    + ((n - 2) * self.link_space) as u64
                    + self.items[n - 1].addrs.len() as u64
            }
        }
    }

    /// Returns the address of the data block at the given logical index.
    ///
    /// Constant time: the index maps straight to one slot of one block.
    pub fn get(&self, index: u64) -> Option<u64> {
        let index = index as usize;
        if index < self.head_space {
            return self.items[0].addrs.get(index);
        }
        let item = 1 + (index - self.head_space) / self.link_space;
        let slot = (index - self.head_space) % self.link_space;
        self.items.get(item)?.addrs.get(slot)
    }

    /// Iterates over data block addresses starting at the given logical
    /// index.
    pub fn data_addresses(&self, offset: u64) -> impl Iterator<Item = u64> + '_ {
        self.items
            .iter()
            .flat_map(|node| node.addrs.iter())
            .skip(offset as usize)
    }

    /// Iterates over the addresses of the index blocks themselves: the head,
    /// then every link.
    pub fn index_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.items.iter().map(|node| node.address)
    }

    fn ensure_ok(&self) -> Result<()> {
        match self.error.get() {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }

    /// Persists the index block at position `index` of the chain.
    fn write_node(&self, index: usize) -> Result<()> {
        let node = &self.items[index];
        if index == 0 {
            let head = Head {
                next: node.next,
                created: self.created,
                modified: self.modified,
                resource: self.resource,
                body: node.addrs.to_body(),
            };
            self.volume.write_head(node.address, &head)
        } else {
            let link = Link {
                next: node.next,
                body: node.addrs.to_body(),
            };
            self.volume.write_link(node.address, &link)
        }
    }

    /// Appends data block addresses to the map.
    ///
    /// Blocks filled on the way are persisted as the chain grows past them;
    /// the final tail block is rewritten exactly once at the end.
    pub fn append(&mut self, addresses: &[u64]) -> Result<()> {
        self.ensure_ok()?;
        if addresses.is_empty() {
            return Ok(());
        }
        let mut rest = addresses;
        while !rest.is_empty() {
            let last = self.items.len() - 1;
            if self.items[last].addrs.is_full() {
                self.grow().map_err(|e| e.wrap(ErrorKind::FbmAppendFailed))?;
                continue;
            }
            let node = &mut self.items[last];
            let take = node.addrs.free_slots().min(rest.len());
            for address in &rest[..take] {
                node.addrs.append(*address);
            }
            rest = &rest[take..];
        }
        let last = self.items.len() - 1;
        if let Err(e) = self.write_node(last) {
            self.error.set(Some(ErrorKind::FbmAppendFailed));
            return Err(e.wrap(ErrorKind::FbmAppendFailed));
        }
        Ok(())
    }

    /// Extends the chain with a fresh, empty link block.
    ///
    /// The new block hits the disk before the tail's `next` pointer does. If
    /// the pointer update fails, the new address is deliberately leaked: the
    /// bitmap keeps it allocated and the map latches the failure.
    fn grow(&mut self) -> Result<()> {
        let address = self
            .space
            .borrow_mut()
            .alloc()
            .map_err(|e| e.wrap(ErrorKind::FbmGrowFailed))?;

        let link = Link::default();
        if let Err(e) = self.volume.write_link(address, &link) {
            // Nothing on disk references the address yet
            let _ = self.space.borrow_mut().free(address);
            return Err(e.wrap(ErrorKind::FbmGrowFailed));
        }
        // TODO trust the in-memory copy instead of reading the fresh link back
        if let Err(e) = self.volume.read_link(address) {
            let _ = self.space.borrow_mut().free(address);
            return Err(e.wrap(ErrorKind::FbmGrowFailed));
        }

        let last = self.items.len() - 1;
        self.items[last].next = address;
        if let Err(e) = self.write_node(last) {
            self.items[last].next = 0;
            self.error.set(Some(ErrorKind::FbmGrowFailed));
            return Err(e.wrap(ErrorKind::FbmGrowFailed));
        }
        log::trace!(
            "file block map at {} grew by link {address}",
            self.items[0].address
        );
        self.items.push(Node {
            address,
            next: 0,
            addrs: AddressArray::new(self.link_space),
        });
        Ok(())
    }

    /// Pops the last `count` data block addresses, returning each to the
    /// address space. Tail blocks emptied on the way are dropped from the
    /// chain.
    pub fn trunc(&mut self, count: u64) -> Result<()> {
        self.ensure_ok()?;
        if count > self.length() {
            return Err(ErrorKind::FbmTruncOutOfRange.into());
        }
        let mut remaining = count;
        let mut tail_dirty = false;
        while remaining > 0 {
            let last = self.items.len() - 1;
            let Some(address) = self.items[last].addrs.pop() else {
                // Empty non-head tail left behind by a previous iteration
                self.shrink()?;
                continue;
            };
            self.space
                .borrow_mut()
                .free(address)
                .map_err(|e| e.wrap(ErrorKind::FbmTruncFailed))?;
            remaining -= 1;
            tail_dirty = true;
            if self.items[last].addrs.is_empty() && self.items.len() > 1 {
                self.shrink()?;
                tail_dirty = false;
            }
        }
        if tail_dirty {
            let last = self.items.len() - 1;
            if let Err(e) = self.write_node(last) {
                self.error.set(Some(ErrorKind::FbmTruncFailed));
                return Err(e.wrap(ErrorKind::FbmTruncFailed));
            }
        }
        Ok(())
    }

    /// Drops the tail block of the chain.
    ///
    /// The predecessor's `next` is cleared and persisted first; only then is
    /// the tail's own address returned to the space.
    fn shrink(&mut self) -> Result<()> {
        if self.items.len() < 2 {
            return Err(ErrorKind::FbmShrinkFailed.into());
        }
        let prev = self.items.len() - 2;
        self.items[prev].next = 0;
        if let Err(e) = self.write_node(prev) {
            self.error.set(Some(ErrorKind::FbmShrinkFailed));
            return Err(e.wrap(ErrorKind::FbmShrinkFailed));
        }
        let Some(tail) = self.items.pop() else {
            return Err(ErrorKind::FbmShrinkFailed.into());
        };
        self.space
            .borrow_mut()
            .free(tail.address)
            .map_err(|e| e.wrap(ErrorKind::FbmShrinkFailed))?;
        log::trace!(
            "file block map at {} dropped link {}",
            self.items[0].address,
            tail.address
        );
        Ok(())
    }

    /// Updates the head metadata and rewrites the whole head block.
    pub fn set_metadata(&mut self, update: MetadataUpdate) -> Result<()> {
        self.ensure_ok()?;
        if let Some(created) = update.created {
            self.created = created;
        }
        if let Some(modified) = update.modified {
            self.modified = modified;
        }
        if let Some(resource) = update.resource {
            self.resource = resource;
        }
        if let Err(e) = self.write_node(0) {
            self.error.set(Some(ErrorKind::FbmAppendFailed));
            return Err(e);
        }
        Ok(())
    }
}
