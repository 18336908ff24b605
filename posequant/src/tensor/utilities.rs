use anyhow::{Result, ensure};

/// Row-major strides of `shape`.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Numpy broadcasting of two shapes, aligned on the trailing axis.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        ensure!(
            da == db || da == 1 || db == 1,
            "shapes {:?} and {:?} are not broadcastable",
            a,
            b
        );
        out[i] = da.max(db);
    }
    Ok(out)
}

/// For every element of `out_shape`, the flat index of the source element in a tensor of
/// `shape` broadcast to `out_shape`.
pub(crate) fn broadcast_index_map(shape: &[usize], out_shape: &[usize]) -> Vec<usize> {
    let offset = out_shape.len() - shape.len();
    let src_strides = strides(shape);
    let out_strides = strides(out_shape);
    let len: usize = out_shape.iter().product();
    (0..len)
        .map(|flat| {
            let mut rem = flat;
            let mut src = 0;
            for (axis, stride) in out_strides.iter().enumerate() {
                let coord = rem / stride;
                rem %= stride;
                if axis >= offset && shape[axis - offset] != 1 {
                    src += coord * src_strides[axis - offset];
                }
            }
            src
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert!(strides(&[]).is_empty());
    }

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[1, 3, 4, 4], &[3, 1, 1]).unwrap(), vec![1, 3, 4, 4]);
        assert!(broadcast_shapes(&[2, 3], &[4]).is_err());
    }

    #[test]
    fn test_broadcast_index_map_channel() {
        let map = broadcast_index_map(&[2, 1], &[2, 3]);
        assert_eq!(map, vec![0, 0, 0, 1, 1, 1]);
    }
}
