//! Resting-state network templates and comparison of spatial maps.
//!
//! All images compared here must already share one voxel grid, nothing is
//! resampled.

use std::fs;

use camino::Utf8Path;
use ndarray::{Array2, Array3, ArrayD, ArrayView1, Axis, IxDyn};
use rayon::prelude::*;

use crate::error::RsnError;
use crate::image::{Image, to_image3};

/// A 4-D template image with one network per volume and its labels.
///
/// The labels file lists one network per line as `<name>, <index>, ...`:
///
/// ```text
/// Basal Ganglia, 21
/// Auditory, 17
/// Sensorimotor, 7, 23, 24, 38, 56, 29
/// ```
#[derive(Debug, Clone)]
pub struct RestingStateNetworks {
    image: Image,
    names: Vec<(usize, String)>,
    start_from_one: bool,
}

impl RestingStateNetworks {
    /// Opens a template and its labels.
    ///
    /// With `start_from_one` the label indices count volumes from 1.
    pub fn open(
        img_file: impl AsRef<Utf8Path>,
        labels_file: impl AsRef<Utf8Path>,
        start_from_one: bool,
    ) -> Result<Self, RsnError> {
        let text = fs::read_to_string(labels_file.as_ref())?;
        let image = Image::open(img_file)?;
        Self::new(image, &text, start_from_one)
    }

    pub fn new(image: Image, labels: &str, start_from_one: bool) -> Result<Self, RsnError> {
        let mut names: Vec<(usize, String)> = Vec::new();

        for (name, indices) in parse_labels(labels)? {
            for index in indices {
                match names.iter_mut().find(|(i, _)| *i == index) {
                    Some(entry) => entry.1 = name.clone(),
                    None => names.push((index, name.clone())),
                }
            }
        }

        let images = image.n_volumes();
        if names.len() > images {
            return Err(RsnError::TooManyLabels {
                labels: names.len(),
                images,
            });
        }

        Ok(Self {
            image,
            names,
            start_from_one,
        })
    }

    /// `(index, name)` of every listed network, in file order.
    pub fn network_names(&self) -> &[(usize, String)] {
        &self.names
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, name)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// The volume of the network listed under `index`.
    pub fn network(&self, index: usize) -> Result<Array3<f32>, RsnError> {
        if self.name(index).is_none() {
            return Err(RsnError::UnknownNetwork(index));
        }

        let volume = if self.start_from_one {
            index.checked_sub(1).ok_or(RsnError::UnknownNetwork(index))?
        } else {
            index
        };

        Ok(self.image.volume(volume)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<(usize, Array3<f32>), RsnError>> + '_ {
        self.names
            .iter()
            .map(|(index, _)| self.network(*index).map(|volume| (*index, volume)))
    }

    /// Binary mask of the voxels covered by any of `indices`.
    pub fn join_networks(&self, indices: &[usize]) -> Result<Image, RsnError> {
        let Some((&first, rest)) = indices.split_first() else {
            return Err(RsnError::UnknownNetwork(0));
        };

        let mut sum = self.network(first)?;
        for &index in rest {
            sum += &self.network(index)?;
        }

        let mask = sum.mapv(|v| if v != 0.0 { 1.0 } else { 0.0 });
        Ok(to_image3(mask, &self.image))
    }
}

/// Parses the lines of a labels file into `(name, indices)`.
pub fn parse_labels(text: &str) -> Result<Vec<(String, Vec<usize>)>, RsnError> {
    let mut networks = Vec::new();

    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let mut parts = line.split(',');
        let name = parts.next().unwrap_or_default().trim().to_string();

        let indices = parts
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                token.parse::<usize>().map_err(|_| RsnError::Label {
                    line: number + 1,
                    token: token.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        networks.push((name, indices));
    }

    Ok(networks)
}

/// Correlation similarity of every template volume with every component
/// volume inside `mask`, as `(n_templates, n_components)`.
///
/// Similarity is one minus the correlation distance. Constant maps have no
/// defined correlation and score 0.
pub fn spatial_maps_pairwise_similarity(
    rsn: &Image,
    ic: &Image,
    mask: &Image,
) -> Result<Array2<f64>, RsnError> {
    check_grid(rsn, ic)?;
    let mask = mask_flags(mask, ic)?;

    let components = masked_volumes(ic, &mask)?;
    let rows = (0..rsn.n_volumes())
        .into_par_iter()
        .map(|r| -> Result<Vec<f64>, RsnError> {
            let template = masked(&rsn.volume(r)?, &mask);
            Ok(components
                .iter()
                .map(|component| correlation(&template, component))
                .collect::<Vec<_>>())
        })
        .collect::<Result<Vec<_>, RsnError>>()?;

    to_matrix(rows, ic.n_volumes())
}

/// Goodness of fit of every component to every template.
///
/// Templates are thresholded at `rsn_thr` in absolute value first (a
/// non-positive threshold keeps them as they are). The score multiplies the
/// difference of the mean component value inside and outside the template
/// with the difference, in percent, of positive voxels inside and outside.
/// Voxels outside the template only count inside `mask`.
pub fn spatial_maps_goodness_of_fit(
    rsn: &Image,
    ic: &Image,
    mask: &Image,
    rsn_thr: f64,
) -> Result<Array2<f64>, RsnError> {
    check_grid(rsn, ic)?;
    let mask = mask_flags(mask, ic)?;

    let components = (0..ic.n_volumes())
        .map(|c| ic.volume(c).map(|v| v.mapv(f64::from)))
        .collect::<Result<Vec<_>, _>>()?;

    let rows = (0..rsn.n_volumes())
        .into_par_iter()
        .map(|r| -> Result<Vec<f64>, RsnError> {
            let template = rsn.volume(r)?.mapv(|v| {
                let v = f64::from(v);
                if rsn_thr > 0.0 && v.abs() < rsn_thr { 0.0 } else { v }
            });

            let inside: Vec<bool> = template.iter().map(|v| v.abs() > 0.0).collect();
            let outside: Vec<bool> = template
                .iter()
                .zip(&mask)
                .map(|(&v, &m)| v == 0.0 && m)
                .collect();

            Ok(components
                .iter()
                .map(|component| goodness_of_fit(component, &inside, &outside))
                .collect::<Vec<_>>())
        })
        .collect::<Result<Vec<_>, RsnError>>()?;

    to_matrix(rows, ic.n_volumes())
}

fn goodness_of_fit(component: &Array3<f64>, inside: &[bool], outside: &[bool]) -> f64 {
    let total = component.len() as f64;
    let (mut sum_in, mut sum_out) = (0.0, 0.0);
    let (mut pos_in, mut pos_out) = (0usize, 0usize);

    for ((&v, &is_in), &is_out) in component.iter().zip(inside).zip(outside) {
        if is_in {
            sum_in += v;
            pos_in += usize::from(v > 0.0);
        }
        if is_out {
            sum_out += v;
            pos_out += usize::from(v > 0.0);
        }
    }

    // means run over the whole volume, zeros included
    let mean_diff = (sum_in - sum_out) / total;

    let positives = pos_in + pos_out;
    let pos_diff = match positives {
        0 => 0.0,
        _ => (pos_in as f64 - pos_out as f64) * 100.0 / positives as f64,
    };

    mean_diff * pos_diff
}

/// Correlation of `vector` with the series along the last axis of `data`.
///
/// The result has the shape of `data` without its last axis. Constant series
/// give 0.
pub fn nd_vector_correlations(
    data: &ArrayD<f32>,
    vector: ArrayView1<f64>,
) -> Result<ArrayD<f64>, RsnError> {
    let last = data.ndim().checked_sub(1).ok_or(RsnError::Samples {
        expected: 0,
        found: vector.len(),
    })?;

    let samples = data.shape()[last];
    if samples != vector.len() {
        return Err(RsnError::Samples {
            expected: samples,
            found: vector.len(),
        });
    }

    let vector: Vec<f64> = vector.to_vec();
    let shape = IxDyn(&data.shape()[..last]);

    let values: Vec<f64> = data
        .lanes(Axis(last))
        .into_iter()
        .map(|lane| {
            let series: Vec<f64> = lane.iter().map(|&v| f64::from(v)).collect();
            correlation(&series, &vector)
        })
        .collect();

    ArrayD::from_shape_vec(shape, values).map_err(|e| RsnError::Image(e.into()))
}

/// Pearson correlation, 0 when either side is constant.
fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (da, db) = (x - mean_a, y - mean_b);
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denominator = (var_a * var_b).sqrt();
    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }

    cov / denominator
}

fn check_grid(a: &Image, b: &Image) -> Result<(), RsnError> {
    if a.same_grid(b) {
        Ok(())
    } else {
        Err(RsnError::Grid(
            a.spatial_shape().to_vec(),
            b.spatial_shape().to_vec(),
        ))
    }
}

fn mask_flags(mask: &Image, reference: &Image) -> Result<Vec<bool>, RsnError> {
    if mask.spatial_shape() != reference.spatial_shape() {
        return Err(RsnError::Grid(
            mask.spatial_shape().to_vec(),
            reference.spatial_shape().to_vec(),
        ));
    }

    Ok(mask.volume(0)?.iter().map(|&v| v != 0.0).collect())
}

fn masked(volume: &Array3<f32>, mask: &[bool]) -> Vec<f64> {
    volume
        .iter()
        .zip(mask)
        .filter(|&(_, &keep)| keep)
        .map(|(&v, _)| f64::from(v))
        .collect()
}

fn masked_volumes(image: &Image, mask: &[bool]) -> Result<Vec<Vec<f64>>, RsnError> {
    (0..image.n_volumes())
        .map(|i| Ok(masked(&image.volume(i)?, mask)))
        .collect()
}

fn to_matrix(rows: Vec<Vec<f64>>, columns: usize) -> Result<Array2<f64>, RsnError> {
    let n_rows = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n_rows, columns), flat).map_err(|e| RsnError::Image(e.into()))
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, IxDyn};

    use super::*;
    use crate::image::new_image;

    /// Four 3x3x3 volumes, each a different blob.
    fn templates() -> Image {
        let data = ArrayD::from_shape_fn(IxDyn(&[3, 3, 3, 4]), |ix| match (ix[0], ix[3]) {
            (0, 0) | (1, 1) | (2, 2) => 5.0,
            (_, 3) => (ix[1] + ix[2]) as f32,
            _ => 0.0,
        });
        new_image(data, [2.0, 2.0, 2.0])
    }

    fn full_mask() -> Image {
        new_image(ArrayD::ones(IxDyn(&[3, 3, 3])), [2.0, 2.0, 2.0])
    }

    #[test]
    fn test_parse_labels() {
        let text = "Basal Ganglia, 21\nSensorimotor, 7, 23,24\n\nVisual,46\n";
        let labels = parse_labels(text).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[0], ("Basal Ganglia".to_string(), vec![21]));
        assert_eq!(labels[1], ("Sensorimotor".to_string(), vec![7, 23, 24]));

        assert!(matches!(
            parse_labels("Visual, 4x"),
            Err(RsnError::Label { line: 1, .. })
        ));
    }

    #[test]
    fn test_networks_by_index() {
        let rsns = RestingStateNetworks::new(templates(), "Motor, 1, 3\nVisual, 2\n", true).unwrap();
        assert_eq!(rsns.len(), 3);
        assert_eq!(
            rsns.network_names(),
            &[
                (1, "Motor".to_string()),
                (3, "Motor".to_string()),
                (2, "Visual".to_string())
            ]
        );

        let visual = rsns.network(2).unwrap();
        assert_eq!(visual[[1, 0, 0]], 5.0);
        assert_eq!(visual[[0, 0, 0]], 0.0);

        assert!(matches!(rsns.network(4), Err(RsnError::UnknownNetwork(4))));
        assert_eq!(rsns.iter().count(), 3);
    }

    #[test]
    fn test_too_many_labels() {
        let err = RestingStateNetworks::new(templates(), "A, 1, 2, 3\nB, 4, 5\n", true).unwrap_err();
        assert!(matches!(
            err,
            RsnError::TooManyLabels {
                labels: 5,
                images: 4
            }
        ));
    }

    #[test]
    fn test_join_networks() {
        let rsns = RestingStateNetworks::new(templates(), "Motor, 0, 1\n", false).unwrap();
        let joined = rsns.join_networks(&[0, 1]).unwrap();

        assert_eq!(joined.shape(), &[3, 3, 3]);
        assert_eq!(joined.data[[0, 1, 1]], 1.0);
        assert_eq!(joined.data[[1, 2, 0]], 1.0);
        assert_eq!(joined.data[[2, 0, 0]], 0.0);
    }

    #[test]
    fn test_similarity_with_itself() {
        let images = templates();
        let similarity =
            spatial_maps_pairwise_similarity(&images, &images, &full_mask()).unwrap();

        assert_eq!(similarity.shape(), &[4, 4]);
        for i in 0..4 {
            assert!((similarity[[i, i]] - 1.0).abs() < 1e-9);
        }
        assert!(similarity[[0, 1]] < 0.0);
    }

    #[test]
    fn test_similarity_needs_same_grid() {
        let other = new_image(ArrayD::zeros(IxDyn(&[3, 3, 4, 2])), [2.0, 2.0, 2.0]);
        assert!(matches!(
            spatial_maps_pairwise_similarity(&templates(), &other, &full_mask()),
            Err(RsnError::Grid(..))
        ));
    }

    #[test]
    fn test_goodness_of_fit() {
        let images = templates();
        let gof = spatial_maps_goodness_of_fit(&images, &images, &full_mask(), 4.0).unwrap();
        assert_eq!(gof.shape(), &[4, 4]);

        // blob 0 against itself: 9 voxels of 5 inside, nothing outside
        let expected = (9.0 * 5.0 / 27.0) * 100.0;
        assert!((gof[[0, 0]] - expected).abs() < 1e-9);

        // gradient map: 8 of 9 voxels positive inside, 16 of 18 outside
        let expected = ((18.0 - 36.0) / 27.0) * ((8.0 - 16.0) * 100.0 / 24.0);
        assert!((gof[[0, 3]] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_nd_vector_correlations() {
        let vector = Array1::from(vec![1.0, 2.0, 3.0, 4.0]);
        let data = ArrayD::from_shape_fn(IxDyn(&[2, 1, 1, 4]), |ix| match ix[0] {
            0 => ix[3] as f32,
            _ => 7.0,
        });

        let corrs = nd_vector_correlations(&data, vector.view()).unwrap();
        assert_eq!(corrs.shape(), &[2, 1, 1]);
        assert!((corrs[[0, 0, 0]] - 1.0).abs() < 1e-9);
        assert_eq!(corrs[[1, 0, 0]], 0.0);

        let short = Array1::from(vec![1.0, 2.0]);
        assert!(matches!(
            nd_vector_correlations(&data, short.view()),
            Err(RsnError::Samples {
                expected: 4,
                found: 2
            })
        ));
    }
}
