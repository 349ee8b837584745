//! JSON persistence of parameters and of single modules.
use crate::autograd::{Context, ParameterStore};
use crate::graph::{Operation, PhysicalOp};
use crate::tensorshape::TensorShape;
use crate::{NasError, NasFloat};
use log::debug;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

fn create<P: AsRef<Path>>(path: P) -> Result<BufWriter<File>, NasError> {
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Writes every value of `store` as a flat key to tensor map.
///
/// # Errors
pub fn save_parameters<P: AsRef<Path>>(path: P, store: &ParameterStore) -> Result<(), NasError> {
    serde_json::to_writer(create(&path)?, &store.snapshot())?;
    debug!("saved {} parameters to {}", store.len(), path.as_ref().display());
    Ok(())
}

/// # Errors
pub fn load_parameters<P: AsRef<Path>>(
    path: P,
) -> Result<BTreeMap<String, ArrayD<NasFloat>>, NasError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// One operation with its parameters and the input shapes it was exported for, enough
/// to evaluate it outside of the network.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleBundle {
    pub name: String,
    pub operation: PhysicalOp,
    pub input_shapes: Vec<TensorShape>,
    pub parameters: BTreeMap<String, ArrayD<NasFloat>>,
}

impl ModuleBundle {
    /// Parameters the operation has not created yet are initialised in `store`.
    ///
    /// # Errors
    pub fn export(
        operation: &PhysicalOp,
        input_shapes: Vec<TensorShape>,
        store: &mut ParameterStore,
    ) -> Result<Self, NasError> {
        let parameters = operation
            .parameter_specs()
            .iter()
            .map(|spec| {
                store
                    .get_or_create(spec)
                    .map(|p| (spec.key.clone(), p.data.clone()))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            name: operation.name().to_string(),
            operation: operation.clone(),
            input_shapes,
            parameters,
        })
    }

    /// # Errors
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), NasError> {
        serde_json::to_writer_pretty(create(path)?, self)?;
        Ok(())
    }

    /// # Errors
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NasError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Evaluates the operation in inference mode on `inputs`.
    ///
    /// # Errors
    /// Inputs that do not match the exported shapes.
    pub fn forward(&self, inputs: &[ArrayD<NasFloat>]) -> Result<ArrayD<NasFloat>, NasError> {
        if inputs.len() != self.input_shapes.len() {
            return Err(NasError::shape_mismatch(format!(
                "{} takes {} inputs, got {}",
                self.name,
                self.input_shapes.len(),
                inputs.len()
            )));
        }
        for (value, expected) in inputs.iter().zip(&self.input_shapes) {
            let fed = TensorShape::new(value.shape().iter().map(|&d| Some(d)).collect());
            if !fed.is_compatible_with(expected) {
                return Err(NasError::shape_mismatch(format!(
                    "{} fed with {}, expected {}",
                    self.name, fed, expected
                )));
            }
        }
        let mut store = ParameterStore::default();
        store.load(self.parameters.clone())?;
        let mut ctx = Context::new(&mut store, false, 0);
        let ids = inputs
            .iter()
            .map(|v| ctx.input(v.clone()))
            .collect::<Vec<_>>();
        let out = self.operation.forward(&mut ctx, &ids)?;
        Ok(ctx.value(out).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Conv, ConvParams};
    use ndarray::IxDyn;

    #[test]
    fn test_parameters_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/params.json");
        let mut store = ParameterStore::new(5);
        let conv: PhysicalOp = Conv::new("c", ConvParams::new(2, 2, (3, 3)).with_pad((1, 1)))
            .unwrap()
            .into();
        for spec in conv.parameter_specs() {
            store.get_or_create(&spec).unwrap();
        }
        save_parameters(&path, &store).unwrap();
        let loaded = load_parameters(&path).unwrap();
        assert_eq!(loaded, store.snapshot());
    }

    #[test]
    fn test_bundle_reproduces_operation() {
        let dir = tempfile::tempdir().unwrap();
        let conv: PhysicalOp = Conv::new("c", ConvParams::new(2, 3, (1, 1)).with_bias(true))
            .unwrap()
            .into();
        let mut store = ParameterStore::new(1);
        let bundle =
            ModuleBundle::export(&conv, vec![TensorShape::nchw(2, 2, 2).with_batch(1)], &mut store)
                .unwrap();
        assert!(store.contains("c/W"));
        bundle.save(dir.path().join("c.json")).unwrap();
        let bundle = ModuleBundle::load(dir.path().join("c.json")).unwrap();

        let x = crate::test_util::ramp_input(&[1, 2, 2, 2]);
        let expected = {
            let mut ctx = Context::new(&mut store, false, 0);
            let v = ctx.input(x.clone());
            let y = conv.forward(&mut ctx, &[v]).unwrap();
            ctx.value(y).clone()
        };
        crate::test_util::assert_all_close(&bundle.forward(&[x]).unwrap(), &expected, 1e-12);
        assert!(bundle.forward(&[ArrayD::zeros(IxDyn(&[2, 2, 2, 2]))]).is_err());
    }
}
