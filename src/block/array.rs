//! Address array stored in the body of a head or link block.

/// A bounded array of block addresses.
///
/// The on-disk form is the concatenation of the addresses as little-endian
/// `u64` values; the body length field of the owning block tells how many are
/// present. The capacity is the owning block's body size divided by 8.
#[derive(Clone, Debug)]
pub struct AddressArray {
    addrs: Vec<u64>,
    capacity: usize,
}

impl AddressArray {
    /// Creates an empty array with the given slot capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            addrs: Vec::new(),
            capacity,
        }
    }

    /// Parses the array out of a block body.
    ///
    /// Trailing bytes that do not form a full address are ignored.
    pub fn from_body(body: &[u8], capacity: usize) -> Self {
        let addrs = body
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Self { addrs, capacity }
    }

    /// Serializes the array into a block body.
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.addrs.len() * 8);
        for addr in &self.addrs {
            body.extend_from_slice(&addr.to_le_bytes());
        }
        body
    }

    /// Returns the address at the given index.
    pub fn get(&self, index: usize) -> Option<u64> {
        self.addrs.get(index).copied()
    }

    /// Appends an address.
    ///
    /// Returns `false` if the array is full and the address was not stored.
    pub fn append(&mut self, address: u64) -> bool {
        if self.addrs.len() >= self.capacity {
            return false;
        }
        self.addrs.push(address);
        true
    }

    /// Removes and returns the last address.
    pub fn pop(&mut self) -> Option<u64> {
        self.addrs.pop()
    }

    /// Returns the number of stored addresses.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Tells whether the array holds no address.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Tells whether no slot remains.
    pub fn is_full(&self) -> bool {
        self.addrs.len() >= self.capacity
    }

    /// Returns the number of free slots.
    pub fn free_slots(&self) -> usize {
        self.capacity - self.addrs.len()
    }

    /// Returns the slot capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates over the stored addresses in order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.addrs.iter().copied()
    }
}
