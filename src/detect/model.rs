//! Model runtime seam.
//!
//! Backends never touch the ONNX runtime directly; they hand input tensors to a
//! `ModelRunner` and get output tensors back. `TractModel` is the production
//! runner, tests substitute canned outputs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

pub use tract_onnx::prelude::tract_ndarray::{ArrayD, Ix2, IxDyn};

/// Opaque model: f32 tensors in, f32 tensors out.
pub trait ModelRunner: Send {
    fn run(&self, inputs: Vec<ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>>;
}

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// ONNX model executed with tract on the CPU.
pub struct TractModel {
    plan: Plan,
    path: PathBuf,
}

impl fmt::Debug for TractModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TractModel")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TractModel {
    /// Load an ONNX model from disk and prepare it for inference.
    ///
    /// `input_shape` pins the first input when the model is exported with a
    /// fixed canvas; dynamic models keep their declared facts.
    pub fn load<P: AsRef<Path>>(model_path: P, input_shape: Option<&[usize]>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let started = Instant::now();
        let mut model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?;
        if let Some(shape) = input_shape {
            model = model
                .with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        f32::datum_type(),
                        shape.iter().copied().collect::<TVec<usize>>(),
                    ),
                )
                .context("failed to set input fact")?;
        }
        let plan = model
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        log::info!(
            "loaded {} in {} ms (device: cpu)",
            model_path.display(),
            started.elapsed().as_millis()
        );
        Ok(Self {
            plan,
            path: model_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ModelRunner for TractModel {
    fn run(&self, inputs: Vec<ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>> {
        let inputs: TVec<TValue> = inputs
            .into_iter()
            .map(|array| array.into_tensor().into())
            .collect();
        let outputs = self
            .plan
            .run(inputs)
            .with_context(|| format!("ONNX inference failed for {}", self.path.display()))?;
        outputs
            .iter()
            .map(|output| {
                let as_f32 = output
                    .cast_to::<f32>()
                    .context("model output tensor could not be cast to f32")?;
                Ok(as_f32.to_array_view::<f32>()?.to_owned())
            })
            .collect()
    }
}

/// Fetch output `index` or fail with a shape error.
pub(crate) fn output(outputs: &[ArrayD<f32>], index: usize) -> Result<&ArrayD<f32>> {
    outputs
        .get(index)
        .ok_or_else(|| anyhow!("model produced {} outputs, expected output #{}", outputs.len(), index))
}

/// Drop leading axes of length 1 until `ndim` axes remain.
pub(crate) fn squeeze_leading(array: &ArrayD<f32>, ndim: usize) -> Result<ArrayD<f32>> {
    let mut view = array.view();
    while view.ndim() > ndim && view.shape()[0] == 1 {
        view = view.index_axis_move(tract_ndarray::Axis(0), 0);
    }
    if view.ndim() != ndim {
        return Err(anyhow!(
            "expected a {}-d tensor, got shape {:?}",
            ndim,
            array.shape()
        ));
    }
    Ok(view.to_owned())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Returns fixed outputs and records every input batch.
    pub(crate) struct CannedModel {
        pub outputs: Vec<ArrayD<f32>>,
        pub seen: Arc<Mutex<Vec<Vec<ArrayD<f32>>>>>,
    }

    impl CannedModel {
        pub fn new(outputs: Vec<ArrayD<f32>>) -> Self {
            Self {
                outputs,
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ModelRunner for CannedModel {
        fn run(&self, inputs: Vec<ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>> {
            self.seen.lock().unwrap().push(inputs);
            Ok(self.outputs.clone())
        }
    }

    pub(crate) fn array(shape: &[usize], data: Vec<f32>) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    #[test]
    fn squeeze_drops_batch_axis() {
        let boxes = array(&[1, 2, 4], (0..8).map(|v| v as f32).collect());
        let squeezed = squeeze_leading(&boxes, 2).unwrap();
        assert_eq!(squeezed.shape(), &[2, 4]);
        assert_eq!(squeezed[[1, 0]], 4.0);

        let flat = array(&[3], vec![1.0, 2.0, 3.0]);
        assert_eq!(squeeze_leading(&flat, 1).unwrap().shape(), &[3]);
        assert!(squeeze_leading(&flat, 2).is_err());
    }

    #[test]
    fn missing_output_is_an_error() {
        let outputs = vec![array(&[1], vec![0.0])];
        assert!(output(&outputs, 0).is_ok());
        assert!(output(&outputs, 1).is_err());
    }

    #[test]
    fn load_fails_for_missing_file() {
        let err = TractModel::load("does/not/exist.onnx", None).unwrap_err();
        assert!(err.to_string().contains("failed to load ONNX model"));
    }
}
