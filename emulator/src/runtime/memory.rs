use crate::constants as C;

/// The flat 64 K word memory. Every address is valid; the address space
/// is exactly the range of a word.
pub struct Memory {
    cells: Vec<C::Word>,
}

impl Default for Memory {
    fn default() -> Self {
        Memory {
            cells: vec![0; C::MEMORY_SIZE],
        }
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Memory {{ [...] }}")
    }
}

impl Memory {
    #[must_use]
    pub fn get(&self, address: C::Address) -> C::Word {
        self.cells[usize::from(address)]
    }

    pub fn set(&mut self, address: C::Address, value: C::Word) {
        self.cells[usize::from(address)] = value;
    }

    /// Copy an assembled image to the bottom of memory
    pub fn load_image(&mut self, image: &[C::Word]) {
        let n = image.len().min(C::MEMORY_SIZE);
        self.cells[..n].copy_from_slice(&image[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_image_test() {
        let mut memory = Memory::default();
        memory.load_image(&[1, 2, 3]);
        assert_eq!(memory.get(0), 1);
        assert_eq!(memory.get(2), 3);
        assert_eq!(memory.get(3), 0);
        memory.set(0xffff, 42);
        assert_eq!(memory.get(0xffff), 42);
    }
}
