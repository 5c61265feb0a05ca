//! NIfTI volumes as `ndarray` arrays plus the header they came with.

use camino::Utf8Path;
use ndarray::{Array3, ArrayD, Axis, Ix3, IxDyn, Slice};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::error::ImageError;

/// A volumetric image: voxel data in `(x, y, z[, t])` order and its header.
#[derive(Debug, Clone)]
pub struct Image {
    pub data: ArrayD<f32>,
    pub header: NiftiHeader,
}

impl Image {
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let read = |source| ImageError::Read {
            path: path.to_path_buf(),
            source,
        };

        let object = ReaderOptions::new().read_file(path).map_err(read)?;
        let header = object.header().clone();
        let data = object.into_volume().into_ndarray::<f32>().map_err(read)?;

        Ok(Self { data, header })
    }

    pub fn save(&self, path: impl AsRef<Utf8Path>) -> Result<(), ImageError> {
        let path = path.as_ref();

        WriterOptions::new(path)
            .reference_header(&self.header)
            .write_nifti(&self.data)
            .map_err(|source| ImageError::Write {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// The first three dimensions.
    pub fn spatial_shape(&self) -> &[usize] {
        let shape = self.data.shape();
        &shape[..shape.len().min(3)]
    }

    /// Number of volumes along the fourth axis, 1 for a 3-D image.
    pub fn n_volumes(&self) -> usize {
        match self.data.ndim() {
            3 => 1,
            _ => self.data.shape().get(3).copied().unwrap_or(1),
        }
    }

    /// The voxel-to-world transform as its three affine rows.
    ///
    /// Uses the sform rows when the header declares them and falls back to
    /// plain voxel scaling otherwise.
    pub fn affine(&self) -> [[f32; 4]; 3] {
        let h = &self.header;
        if h.sform_code != 0 {
            [h.srow_x, h.srow_y, h.srow_z]
        } else {
            [
                [h.pixdim[1], 0.0, 0.0, 0.0],
                [0.0, h.pixdim[2], 0.0, 0.0],
                [0.0, 0.0, h.pixdim[3], 0.0],
            ]
        }
    }

    /// Whether both images sample space on the same voxel grid.
    pub fn same_grid(&self, other: &Image) -> bool {
        self.spatial_shape() == other.spatial_shape() && self.affine() == other.affine()
    }

    /// The volume at `index` of a 4-D image, or the image itself if 3-D.
    pub fn volume(&self, index: usize) -> Result<Array3<f32>, ImageError> {
        let count = self.n_volumes();
        if index >= count {
            return Err(ImageError::Volume { index, count });
        }

        let view = match self.data.ndim() {
            3 => self.data.view(),
            4 => self.data.index_axis(Axis(3), index),
            _ => {
                return Err(ImageError::Rank {
                    expected: 4,
                    found: self.shape().to_vec(),
                });
            }
        };

        Ok(view.to_owned().into_dimensionality::<Ix3>()?)
    }

    /// Volumes `begin..end` of a 4-D image.
    pub fn volumes(&self, begin: usize, end: usize) -> Result<Image, ImageError> {
        if self.data.ndim() != 4 {
            return Err(ImageError::Rank {
                expected: 4,
                found: self.shape().to_vec(),
            });
        }

        let count = self.n_volumes();
        if begin >= end || end > count {
            return Err(ImageError::Volume {
                index: begin.max(end.saturating_sub(1)),
                count,
            });
        }

        let data = self
            .data
            .slice_axis(Axis(3), Slice::from(begin..end))
            .to_owned();

        Ok(to_image(data, self))
    }
}

/// Wraps a raw array in an image that borrows the header and affine of
/// `reference`.
pub fn to_image(raw: ArrayD<f32>, reference: &Image) -> Image {
    let mut header = reference.header.clone();

    header.dim = [1; 8];
    header.dim[0] = raw.ndim() as u16;
    for (i, &len) in raw.shape().iter().take(7).enumerate() {
        header.dim[i + 1] = len as u16;
    }

    Image { data: raw, header }
}

/// Wraps a 3-D array, see [`to_image`].
pub fn to_image3(raw: Array3<f32>, reference: &Image) -> Image {
    to_image(raw.into_dyn(), reference)
}

/// Axis-aligned extent of an image in world coordinates (millimetres).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub low: [f64; 3],
    pub high: [f64; 3],
}

/// Computes the world-space bounding box of the voxel grid of `image`.
pub fn bounding_box(image: &Image) -> BoundingBox {
    let shape = image.spatial_shape();
    let affine = image.affine();

    let mut low = [f64::INFINITY; 3];
    let mut high = [f64::NEG_INFINITY; 3];

    for corner in 0..8u8 {
        let voxel: [f64; 3] = std::array::from_fn(|axis| {
            let extent = shape.get(axis).copied().unwrap_or(1).saturating_sub(1);
            f64::from((corner >> (2 - axis)) & 1) * extent as f64
        });

        for (row, (lo, hi)) in affine.iter().zip(low.iter_mut().zip(high.iter_mut())) {
            let world = voxel
                .iter()
                .zip(row)
                .map(|(v, &a)| v * f64::from(a))
                .sum::<f64>()
                + f64::from(row[3]);
            *lo = lo.min(world);
            *hi = hi.max(world);
        }
    }

    BoundingBox { low, high }
}

/// Opens `path` and returns its bounding box.
pub fn get_bounding_box(path: impl AsRef<Utf8Path>) -> Result<BoundingBox, ImageError> {
    Ok(bounding_box(&Image::open(path)?))
}

/// Builds a fresh image with a default header, scaled by `voxel_size`.
pub fn new_image(data: ArrayD<f32>, voxel_size: [f32; 3]) -> Image {
    let mut header = NiftiHeader {
        scl_slope: 1.0,
        scl_inter: 0.0,
        ..NiftiHeader::default()
    };
    header.pixdim[1..4].copy_from_slice(&voxel_size);

    let reference = Image {
        data: ArrayD::zeros(IxDyn(&[1, 1, 1])),
        header,
    };

    to_image(data, &reference)
}


#[cfg(test)]
mod tests {
    use super::testing::{tmp, write_series};
    use super::*;

    #[test]
    fn test_roundtrip_keeps_shape() {
        let (_guard, dir) = tmp();
        let path = dir.join("series.nii.gz");
        write_series(&path, [3, 4, 5, 6], |x, y, z, t| (x + y + z + t) as f32);

        let image = Image::open(&path).unwrap();
        assert_eq!(image.shape(), &[3, 4, 5, 6]);
        assert_eq!(image.n_volumes(), 6);
        assert_eq!(image.data[[1, 2, 3, 4]], 10.0);
    }

    #[test]
    fn test_volumes_slices_time() {
        let image = new_image(
            ArrayD::from_shape_fn(IxDyn(&[2, 2, 2, 10]), |ix| ix[3] as f32),
            [1.0, 1.0, 1.0],
        );

        let trimmed = image.volumes(6, 10).unwrap();
        assert_eq!(trimmed.shape(), &[2, 2, 2, 4]);
        assert_eq!(trimmed.data[[0, 0, 0, 0]], 6.0);
        assert_eq!(trimmed.header.dim[4], 4);

        assert!(image.volumes(10, 10).is_err());
        assert!(image.volume(10).is_err());
    }

    #[test]
    fn test_same_grid() {
        let a = new_image(ArrayD::zeros(IxDyn(&[4, 4, 4, 2])), [2.0, 2.0, 2.0]);
        let b = new_image(ArrayD::zeros(IxDyn(&[4, 4, 4, 9])), [2.0, 2.0, 2.0]);
        let c = new_image(ArrayD::zeros(IxDyn(&[4, 4, 5, 2])), [2.0, 2.0, 2.0]);
        let d = new_image(ArrayD::zeros(IxDyn(&[4, 4, 4, 2])), [3.0, 2.0, 2.0]);

        assert!(a.same_grid(&b));
        assert!(!a.same_grid(&c));
        assert!(!a.same_grid(&d));
    }

    #[test]
    fn test_bounding_box() {
        let image = new_image(ArrayD::zeros(IxDyn(&[11, 21, 6])), [2.0, 1.0, 3.0]);
        let bbox = bounding_box(&image);
        assert_eq!(bbox.low, [0.0, 0.0, 0.0]);
        assert_eq!(bbox.high, [20.0, 20.0, 15.0]);
    }
}
