//! Chunk grid arithmetic - how an N-dimensional array is divided into chunks

use crate::error::{Result, VoxError};
use crate::utils::ceil_div;

/// Regular chunking of a row-major array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGrid {
    shape: Vec<usize>,
    chunk_shape: Vec<usize>,
}

impl ChunkGrid {
    /// Create a new chunk grid
    pub fn new(shape: Vec<usize>, chunk_shape: Vec<usize>) -> Result<Self> {
        if shape.is_empty() {
            return Err(VoxError::InvalidDimensions(
                "array rank must be at least 1".to_string(),
            ));
        }
        if shape.len() != chunk_shape.len() {
            return Err(VoxError::InvalidDimensions(format!(
                "chunk shape {:?} does not match array rank {}",
                chunk_shape,
                shape.len()
            )));
        }
        if shape.iter().chain(chunk_shape.iter()).any(|&n| n == 0) {
            return Err(VoxError::InvalidDimensions(format!(
                "shape {:?} and chunk shape {:?} must be positive",
                shape, chunk_shape
            )));
        }
        Ok(Self { shape, chunk_shape })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn chunk_shape(&self) -> &[usize] {
        &self.chunk_shape
    }

    /// Get the number of chunks in each dimension
    pub fn chunk_counts(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(&n, &c)| ceil_div(n, c))
            .collect()
    }

    /// Get the total number of chunks
    pub fn total_chunks(&self) -> usize {
        self.chunk_counts().iter().product()
    }

    /// Elements in one (padded) chunk
    pub fn chunk_element_count(&self) -> usize {
        self.chunk_shape.iter().product()
    }

    /// Convert a linear chunk index to chunk coordinates
    pub fn chunk_index_to_coords(&self, index: usize) -> Vec<usize> {
        let counts = self.chunk_counts();
        let mut coords = vec![0; self.rank()];
        let mut remaining = index;

        for (i, coord) in coords.iter_mut().enumerate() {
            let stride: usize = counts.iter().skip(i + 1).product();
            *coord = remaining / stride;
            remaining %= stride;
        }

        coords
    }

    /// Convert chunk coordinates to a linear chunk index
    pub fn chunk_coords_to_index(&self, coords: &[usize]) -> usize {
        let counts = self.chunk_counts();
        coords
            .iter()
            .enumerate()
            .map(|(i, &coord)| coord * counts.iter().skip(i + 1).product::<usize>())
            .sum()
    }

    pub fn is_chunk_in_bounds(&self, coords: &[usize]) -> bool {
        coords.len() == self.rank()
            && coords
                .iter()
                .zip(self.chunk_counts())
                .all(|(&coord, count)| coord < count)
    }

    /// Element range `[start, end)` covered by a chunk, trimmed at array edges
    pub fn chunk_data_range(&self, coords: &[usize]) -> Vec<(usize, usize)> {
        coords
            .iter()
            .enumerate()
            .map(|(i, &coord)| {
                let start = coord * self.chunk_shape[i];
                let end = (start + self.chunk_shape[i]).min(self.shape[i]);
                (start, end)
            })
            .collect()
    }

    /// All chunk coordinates in row-major order
    pub fn iter_chunk_coords(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        (0..self.total_chunks()).map(move |index| self.chunk_index_to_coords(index))
    }

    /// Visit the contiguous rows (along the last axis) a chunk shares with the
    /// array, as `(array_offset, chunk_offset, len)`.
    fn for_each_row(&self, coords: &[usize], mut visit: impl FnMut(usize, usize, usize)) {
        let rank = self.rank();
        let ranges = self.chunk_data_range(coords);
        let extents: Vec<usize> = ranges.iter().map(|(s, e)| e.saturating_sub(*s)).collect();
        if extents.iter().any(|&e| e == 0) {
            return;
        }

        let array_strides = row_major_strides(&self.shape);
        let chunk_strides = row_major_strides(&self.chunk_shape);
        let row_len = extents[rank - 1];
        let mut local = vec![0usize; rank - 1];

        loop {
            let mut array_offset = ranges[rank - 1].0;
            let mut chunk_offset = 0;
            for d in 0..rank - 1 {
                array_offset += (ranges[d].0 + local[d]) * array_strides[d];
                chunk_offset += local[d] * chunk_strides[d];
            }
            visit(array_offset, chunk_offset, row_len);

            let mut d = rank - 1;
            loop {
                if d == 0 {
                    return;
                }
                d -= 1;
                local[d] += 1;
                if local[d] < extents[d] {
                    break;
                }
                local[d] = 0;
            }
        }
    }

    /// Copy one chunk out of a full array, padding edge chunks with `fill`.
    pub fn extract_chunk<T: Copy>(&self, data: &[T], coords: &[usize], fill: T) -> Result<Vec<T>> {
        self.check_array(data.len(), coords)?;
        let mut chunk = vec![fill; self.chunk_element_count()];
        self.for_each_row(coords, |src, dst, len| {
            chunk[dst..dst + len].copy_from_slice(&data[src..src + len]);
        });
        Ok(chunk)
    }

    /// Copy the valid region of a padded chunk into a full array.
    pub fn place_chunk<T: Copy>(&self, out: &mut [T], coords: &[usize], chunk: &[T]) -> Result<()> {
        self.check_array(out.len(), coords)?;
        if chunk.len() != self.chunk_element_count() {
            return Err(VoxError::Corrupt(format!(
                "chunk {:?} holds {} elements, expected {}",
                coords,
                chunk.len(),
                self.chunk_element_count()
            )));
        }
        self.for_each_row(coords, |dst, src, len| {
            out[dst..dst + len].copy_from_slice(&chunk[src..src + len]);
        });
        Ok(())
    }

    fn check_array(&self, len: usize, coords: &[usize]) -> Result<()> {
        let expected: usize = self.shape.iter().product();
        if len != expected {
            return Err(VoxError::InvalidDimensions(format!(
                "array holds {} elements, shape {:?} needs {}",
                len, self.shape, expected
            )));
        }
        if !self.is_chunk_in_bounds(coords) {
            return Err(VoxError::OutOfBounds(format!(
                "chunk {:?} outside chunk counts {:?}",
                coords,
                self.chunk_counts()
            )));
        }
        Ok(())
    }
}

/// Row-major element strides for `shape`
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_grid() -> ChunkGrid {
        ChunkGrid::new(vec![1000, 800, 500], vec![64, 64, 64]).unwrap()
    }

    #[test]
    fn test_chunk_counts() {
        let grid = create_test_grid();
        assert_eq!(grid.chunk_counts(), vec![16, 13, 8]);
        assert_eq!(grid.total_chunks(), 16 * 13 * 8);
    }

    #[test]
    fn test_chunk_index_conversion() {
        let grid = create_test_grid();
        let coords = vec![5, 7, 3];
        let index = grid.chunk_coords_to_index(&coords);
        assert_eq!(grid.chunk_index_to_coords(index), coords);
    }

    #[test]
    fn test_chunk_data_range() {
        let grid = create_test_grid();
        assert_eq!(
            grid.chunk_data_range(&[0, 0, 0]),
            vec![(0, 64), (0, 64), (0, 64)]
        );

        // Last chunk should be trimmed
        assert_eq!(
            grid.chunk_data_range(&[15, 12, 7]),
            vec![(960, 1000), (768, 800), (448, 500)]
        );
    }

    #[test]
    fn test_invalid_grids() {
        assert!(ChunkGrid::new(vec![4, 4], vec![2]).is_err());
        assert!(ChunkGrid::new(vec![4, 0], vec![2, 2]).is_err());
        assert!(ChunkGrid::new(vec![], vec![]).is_err());
    }

    #[test]
    fn test_extract_and_place_edge_chunk() {
        // 3x3 array, 2x2 chunks
        let grid = ChunkGrid::new(vec![3, 3], vec![2, 2]).unwrap();
        let data: Vec<u8> = (1..=9).collect();

        assert_eq!(grid.extract_chunk(&data, &[0, 0], 0).unwrap(), vec![1, 2, 4, 5]);
        assert_eq!(grid.extract_chunk(&data, &[0, 1], 0).unwrap(), vec![3, 0, 6, 0]);
        assert_eq!(grid.extract_chunk(&data, &[1, 1], 0).unwrap(), vec![9, 0, 0, 0]);

        let mut rebuilt = vec![0u8; 9];
        for coords in grid.iter_chunk_coords() {
            let chunk = grid.extract_chunk(&data, &coords, 0).unwrap();
            grid.place_chunk(&mut rebuilt, &coords, &chunk).unwrap();
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_extract_out_of_bounds() {
        let grid = ChunkGrid::new(vec![3], vec![2]).unwrap();
        assert!(grid.extract_chunk(&[1u8, 2, 3], &[2], 0).is_err());
        assert_eq!(grid.extract_chunk(&[1u8, 2, 3], &[1], 9).unwrap(), vec![3, 9]);
    }

    #[test]
    fn test_row_major_strides() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(row_major_strides(&[5]), vec![1]);
    }
}
