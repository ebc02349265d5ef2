/*
    NeonPC
    Bus and peripheral emulation core

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    breakpoints.rs

    Address sets consulted by the frame scheduler: execution breakpoints
    checked against the program counter after every micro-step, and
    watches checked on every RAM write.

*/

/// Terminator of address lists in the legacy debugger format.
pub const ADDRESS_LIST_SENTINEL: u16 = 0o177777;

/// A sorted, de-duplicated set of 16-bit addresses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSet {
    addresses: Vec<u16>,
}

impl AddressSet {
    pub fn new() -> Self {
        Default::default()
    }

    /// Build a set from a legacy address list. Entries after the first sentinel are ignored.
    pub fn from_sentinel_list(list: &[u16]) -> Self {
        list.iter()
            .copied()
            .take_while(|&a| a != ADDRESS_LIST_SENTINEL)
            .collect()
    }

    pub fn insert(&mut self, address: u16) {
        if let Err(pos) = self.addresses.binary_search(&address) {
            self.addresses.insert(pos, address);
        }
    }

    pub fn remove(&mut self, address: u16) {
        if let Ok(pos) = self.addresses.binary_search(&address) {
            self.addresses.remove(pos);
        }
    }

    pub fn clear(&mut self) {
        self.addresses.clear();
    }

    #[inline]
    pub fn contains(&self, address: u16) -> bool {
        !self.addresses.is_empty() && self.addresses.binary_search(&address).is_ok()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.addresses.iter().copied()
    }
}

impl FromIterator<u16> for AddressSet {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut addresses: Vec<u16> = iter.into_iter().collect();
        addresses.sort_unstable();
        addresses.dedup();
        Self { addresses }
    }
}

/// Program counter values that stop a frame.
pub type BreakpointSet = AddressSet;
/// Virtual addresses whose modification stops a frame.
pub type WatchSet = AddressSet;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_and_deduplicated() {
        let set: BreakpointSet = [0o1000, 0o200, 0o1000, 0o40].into_iter().collect();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0o40, 0o200, 0o1000]);
        assert!(set.contains(0o200));
        assert!(!set.contains(0o202));
    }

    #[test]
    fn test_sentinel_list() {
        let set = WatchSet::from_sentinel_list(&[0o100, 0o102, ADDRESS_LIST_SENTINEL, 0o104]);
        assert_eq!(set.len(), 2);
        assert!(!set.contains(0o104));

        let empty = WatchSet::from_sentinel_list(&[ADDRESS_LIST_SENTINEL]);
        assert!(empty.is_empty());
        assert!(!empty.contains(ADDRESS_LIST_SENTINEL));
    }

    #[test]
    fn test_insert_remove() {
        let mut set = AddressSet::new();
        set.insert(6);
        set.insert(2);
        set.insert(6);
        assert_eq!(set.len(), 2);
        set.remove(6);
        assert!(!set.contains(6));
        set.clear();
        assert!(set.is_empty());
    }
}
