//! Typed DMA arrays carved out of the data area.
//!
//! An `Array` is a host view of device memory plus the bus address of each
//! of its elements. Both describe the same bytes: element `i` lives at host
//! offset `offset + i * size_of::<T>()` in the region and at bus address
//! `address + i * size_of::<T>()`.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::slice;

/// Plain scalar types that can live in device memory.
///
/// # Safety
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid value.
pub unsafe trait Element: Copy + Default + fmt::Debug + 'static {
    /// Short type name used in logs (`"uint32"`, `"float32"`, ...).
    const NAME: &'static str;
}

macro_rules! impl_element {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            // SAFETY: primitive integer/float, all bit patterns valid.
            unsafe impl Element for $ty {
                const NAME: &'static str = $name;
            }
        )*
    };
}

impl_element! {
    u8 => "uint8",
    i8 => "int8",
    u16 => "uint16",
    i16 => "int16",
    u32 => "uint32",
    i32 => "int32",
    u64 => "uint64",
    i64 => "int64",
    f32 => "float32",
    f64 => "float64",
}

/// Number of elements described by `shape`, or `None` on overflow.
///
/// An empty shape describes a single scalar.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Row-major multi-dimensional array in device memory.
///
/// Borrowed from the `Driver` that allocated it and never freed on its own;
/// the space is reclaimed when the driver closes.
pub struct Array<'d, T: Element> {
    ptr: NonNull<T>,
    shape: Vec<usize>,
    len: usize,
    offset: usize,
    address: u32,
    _region: PhantomData<&'d [T]>,
}

impl<'d, T: Element> Array<'d, T> {
    /// # Safety
    /// `ptr` must be aligned for `T` and point to `element_count(shape)`
    /// elements of mapped device memory, owned by nothing else, that stays
    /// mapped for `'d`. `address` must be the bus address of `ptr`.
    pub(crate) unsafe fn new(
        ptr: NonNull<u8>,
        offset: usize,
        address: u32,
        shape: &[usize],
    ) -> Self {
        let len = element_count(shape).unwrap_or(0);
        Self {
            ptr: ptr.cast(),
            shape: shape.to_vec(),
            len,
            offset,
            address,
            _region: PhantomData,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn itemsize(&self) -> usize {
        mem::size_of::<T>()
    }

    pub fn nbytes(&self) -> usize {
        self.len * mem::size_of::<T>()
    }

    /// Byte offset of element 0 within the device memory region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bus address of element 0.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Row-major flat position of a multi-dimensional index.
    pub fn flat_index(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut flat = 0usize;
        for (&i, &dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            flat = flat * dim + i;
        }
        Some(flat)
    }

    /// Bus address of the element at flat position `flat`.
    pub fn address_of(&self, flat: usize) -> Option<u32> {
        (flat < self.len).then(|| self.address + (flat * mem::size_of::<T>()) as u32)
    }

    /// Bus address of the element at a multi-dimensional index.
    pub fn address_at(&self, index: &[usize]) -> Option<u32> {
        self.address_of(self.flat_index(index)?)
    }

    /// Bus addresses of all elements, in row-major order.
    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).map(move |flat| self.address + (flat * mem::size_of::<T>()) as u32)
    }

    /// Elements per step along the first axis.
    pub fn row_len(&self) -> usize {
        match self.shape.first() {
            Some(&rows) if rows > 0 => self.len / rows,
            _ => self.len,
        }
    }

    /// Bus address of the first element of `row` along the first axis.
    pub fn row_address(&self, row: usize) -> Option<u32> {
        let rows = *self.shape.first()?;
        if row >= rows {
            return None;
        }
        self.address_of(row * self.row_len())
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: `new` guarantees `len` valid, exclusively owned elements.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as above, and `&mut self` makes the borrow unique.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn get(&self, index: &[usize]) -> Option<T> {
        let flat = self.flat_index(index)?;
        Some(self.as_slice()[flat])
    }

    pub fn get_mut(&mut self, index: &[usize]) -> Option<&mut T> {
        let flat = self.flat_index(index)?;
        Some(&mut self.as_mut_slice()[flat])
    }

    /// Elements of `row` along the first axis.
    pub fn row(&self, row: usize) -> Option<&[T]> {
        let rows = *self.shape.first()?;
        if row >= rows {
            return None;
        }
        let n = self.row_len();
        Some(&self.as_slice()[row * n..(row + 1) * n])
    }

    pub fn row_mut(&mut self, row: usize) -> Option<&mut [T]> {
        let rows = *self.shape.first()?;
        if row >= rows {
            return None;
        }
        let n = self.row_len();
        Some(&mut self.as_mut_slice()[row * n..(row + 1) * n])
    }

    pub fn fill(&mut self, value: T) {
        self.as_mut_slice().fill(value);
    }
}

impl<T: Element> fmt::Debug for Array<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("dtype", &T::NAME)
            .field("shape", &self.shape)
            .field("offset", &self.offset)
            .field("address", &format_args!("{:#010x}", self.address))
            .finish()
    }
}

impl<T: Element> fmt::Display for Array<'_, T> {
    /// One line per row along the first axis.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.len() < 2 {
            return write!(f, "{:?}", self.as_slice());
        }
        for row in 0..self.shape[0] {
            if let Some(values) = self.row(row) {
                writeln!(f, "{:?}", values)?;
            }
        }
        Ok(())
    }
}
