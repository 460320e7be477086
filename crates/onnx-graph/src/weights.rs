use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use memmap2::Mmap;
use safetensors::SafeTensors;
use safetensors::tensor::{Metadata, TensorInfo};
use crate::{onnx, Error};
use crate::onnx::TensorProto;
use crate::tensor::{DType, Shape, Tensor, TensorData};

/// Receives parameter data while a graph is serialized and hands back the matching initializers.
pub trait WeightExternalOutputManager<'a> {
    fn write_pth_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, tensor_info: &candle_core::pickle::TensorInfo, tensors: &candle_core::pickle::PthTensors) -> Result<(), Error> {
        let candle_tensor = tensors.get(&tensor_info.name)?.ok_or_else(|| Error::NoSuchTensorError(tensor_info.name.clone()))?;
        self.write_tensor_data(graph_tensor, TensorData::from_candle_tensor(candle_tensor)?)
    }
    fn write_safetensors_tensor_data(&mut self, graph_tensor: &'a SafetensorsTensor) -> Result<(), Error> {
        let file_index = graph_tensor.file_index;
        let name = &graph_tensor.name;
        let st = SafeTensors::deserialize(&graph_tensor.inner.safetensors_files[file_index])?;
        let data = st.tensor(name)?;
        self.write_tensor_data(graph_tensor, TensorData::from_safetensors_view(data)?)
    }
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, data: TensorData) -> Result<(), Error>;
    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error>;
    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Stores parameters inline as `raw_data`.
#[derive(Default)]
pub struct EmbeddedOutputManager<'a> {
    tensor_data_map: HashMap<&'a dyn Tensor, TensorData>,
}

impl<'a> EmbeddedOutputManager<'a> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl <'a> WeightExternalOutputManager<'a> for EmbeddedOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, tensor_data: TensorData) -> Result<(), Error> {
        self.tensor_data_map.insert(graph_tensor, tensor_data);
        Ok(())
    }

    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error> {
        if let Some(tensor_data) = self.tensor_data_map.remove(&graph_tensor) {
            Ok(Some(tensor_data.to_tensor_data_proto(Some(tensor_name))?))
        }
        else {
            Ok(None)
        }
    }
}

/// Appends parameters to a companion file next to the graph and references them through
/// `external_data` (location, offset, length).
pub struct BinOutputManager<'a> {
    output: BufWriter<File>,
    output_path: PathBuf,
    bytes_written: usize,
    tensor_data_map: HashMap<&'a dyn Tensor, (usize, usize)>,
    location: Option<String>
}

impl<'a> BinOutputManager<'a> {
    pub fn new(output_location: &Path) -> Result<Self, Error> {
        let output = BufWriter::new(File::create(output_location)?);
        Ok(Self {
            output,
            output_path: output_location.to_path_buf(),
            bytes_written: 0,
            tensor_data_map: HashMap::new(),
            location: None
        })
    }
}

impl<'a> WeightExternalOutputManager<'a> for BinOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, data: TensorData) -> Result<(), Error> {
        let offset = self.bytes_written;
        let data = data.to_raw_encoding();
        self.output.write_all(&data)?;
        self.bytes_written += data.len();
        self.tensor_data_map.insert(graph_tensor, (offset, data.len()));
        Ok(())
    }

    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error> {
        if let Some((byte_offset, byte_len)) = self.tensor_data_map.remove(&graph_tensor) {
            let location = self.location.clone()
                .ok_or_else(|| Error::InvalidInputError("external data requested before the weight file was finalized".to_string()))?;
            let external_data = vec![
                onnx::StringStringEntryProto {
                    key: "location".to_string(),
                    value: location,
                },
                onnx::StringStringEntryProto {
                    key: "offset".to_string(),
                    value: format!("{byte_offset}"),
                },
                onnx::StringStringEntryProto {
                    key: "length".to_string(),
                    value: format!("{byte_len}"),
                }
            ];
            Ok(Some(TensorProto {
                name: tensor_name,
                data_type: onnx::tensor_proto::DataType::from(graph_tensor.dtype()) as i32,
                dims: graph_tensor.shape().resolve()?.iter().map(|x| *x as i64).collect(),
                data_location: onnx::tensor_proto::DataLocation::External as i32,
                external_data,
                .. Default::default()
            }))
        }
        else {
            Ok(None)
        }
    }

    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        self.output.flush()?;
        // Locations are relative to the graph file, which lives in the same directory
        let location = self.output_path.file_name()
            .and_then(|x| x.to_str())
            .ok_or_else(|| Error::InvalidInputError(format!("weight file path {} has no usable file name", self.output_path.display())))?;
        self.location = Some(location.to_string());
        Ok(())
    }
}

pub struct PthTensor {
    tensor_info: candle_core::pickle::TensorInfo,
    tensors: Arc<candle_core::pickle::PthTensors>,
    data_type: DType,
    shape: Shape
}

impl PthTensor {
    pub fn new(tensor_info: candle_core::pickle::TensorInfo, tensors: Arc<candle_core::pickle::PthTensors>) -> Result<Arc<Self>, Error> {
        let data_type = DType::from_candle(tensor_info.dtype)?;
        let shape = Shape::from(tensor_info.layout.shape());
        Ok(Arc::new(Self {
            tensors,
            shape,
            tensor_info,
            data_type
        }))
    }
}

impl Tensor for PthTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn gather_weights<'a>(&'a self, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        manager.write_pth_tensor_data(self, &self.tensor_info, &self.tensors)
    }

    fn get_initializer<'a>(&'a self, name: String, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<TensorProto>, Error> {
        manager.get_initializer(self, name)
    }

    fn parameter_bytes(&self) -> usize {
        self.shape.num_elements().unwrap_or(0) * self.data_type.size_in_bytes()
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.tensor_info.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

/// Prefix-addressable view over a checkpoint's named parameters.
pub trait WeightManager {
    fn prefix(&self, name: &str) -> Self;
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error>;
    fn get_prefix_tail(&self) -> Option<&str>;
    fn get_prefix(&self) -> Option<&str>;
    fn get_tensor_names(&self) -> Vec<String>;

    fn full_name(&self, name: &str) -> String {
        match self.get_prefix() {
            Some(prefix) => format!("{}.{}", prefix, name),
            None => name.to_string()
        }
    }

    /// Like `get_tensor`, but a missing entry is `Ok(None)` instead of an error.
    fn get_optional_tensor(&self, name: &str) -> Result<Option<Arc<dyn Tensor>>, Error> {
        match self.get_tensor(name) {
            Ok(tensor) => Ok(Some(tensor)),
            Err(Error::NoSuchTensorError(_)) => Ok(None),
            Err(err) => Err(err)
        }
    }
}

pub struct PthWeightManager {
    prefix_tail: Option<String>,
    prefix: Option<String>,
    pth_tensors: Arc<candle_core::pickle::PthTensors>
}

impl PthWeightManager {
    pub fn new(pth_tensors: Arc<candle_core::pickle::PthTensors>) -> Self {
        Self {
            prefix_tail: None,
            prefix: None,
            pth_tensors
        }
    }

    pub fn open(path: &Path) -> Result<Self, Error> {
        Ok(Self::new(Arc::new(candle_core::pickle::PthTensors::new(path, None)?)))
    }
}

impl WeightManager for PthWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix_tail: Some(name.to_string()),
            prefix: Some(self.full_name(name)),
            pth_tensors: self.pth_tensors.clone()
        }
    }
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let name = self.full_name(name);
        let tensor_info = self.pth_tensors.tensor_infos().get(&name).ok_or(Error::NoSuchTensorError(name))?;
        Ok(PthTensor::new(tensor_info.clone(), self.pth_tensors.clone())?)
    }
    fn get_prefix_tail(&self) -> Option<&str> {
        self.prefix_tail.as_deref()
    }
    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pth_tensors.tensor_infos().keys().map(|x| x.to_string()).collect();
        names.sort();
        names
    }
}

pub struct SafetensorsWeightManagerInner {
    safetensors_files: Vec<Arc<Mmap>>,
    safetensors_metadata: Vec<(usize, Metadata)>
}

impl SafetensorsWeightManagerInner {
    pub fn new(safetensors_files: Vec<Arc<Mmap>>) -> Result<Self, Error> {
        let mut safetensors_metadata = vec![];
        for safetensors_mmap in &safetensors_files {
            safetensors_metadata.push(SafeTensors::read_metadata(safetensors_mmap)?);
        }
        Ok(Self {
            safetensors_files,
            safetensors_metadata
        })
    }

    pub fn get_tensor_info(&self, name: &str) -> Option<(usize, TensorInfo)> {
        for (i, metadata) in self.safetensors_metadata.iter().enumerate() {
            if let Some(tensor_info) = metadata.1.info(name) {
                return Some((i, tensor_info.clone()));
            }
        }
        None
    }

    fn get_tensor_names(&self) -> Vec<String> {
        let mut out = vec![];
        for metadata in &self.safetensors_metadata {
            out.extend(metadata.1.tensors().into_keys());
        }
        out.sort();
        out
    }
}

pub struct SafetensorsWeightManager {
    prefix_tail: Option<String>,
    prefix: Option<String>,
    inner: Arc<SafetensorsWeightManagerInner>
}

impl SafetensorsWeightManager {
    pub fn new(safetensors_files: Vec<Arc<Mmap>>) -> Result<Self, Error> {
        Ok(Self {
            prefix_tail: None,
            prefix: None,
            inner: Arc::new(SafetensorsWeightManagerInner::new(safetensors_files)?)
        })
    }

    /// Memory-maps every given `.safetensors` file.
    pub fn open(paths: &[PathBuf]) -> Result<Self, Error> {
        let mut mmaps = vec![];
        for path in paths {
            let file = File::open(path)?;
            // The checkpoint is treated as read-only for the lifetime of the process
            let mmap = unsafe { Mmap::map(&file) }?;
            mmaps.push(Arc::new(mmap));
        }
        Self::new(mmaps)
    }
}

impl WeightManager for SafetensorsWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix_tail: Some(name.to_string()),
            prefix: Some(self.full_name(name)),
            inner: self.inner.clone()
        }
    }
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        Ok(Arc::new(SafetensorsTensor::new(self.inner.clone(), self.full_name(name))?))
    }
    fn get_prefix_tail(&self) -> Option<&str> {
        self.prefix_tail.as_deref()
    }
    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        self.inner.get_tensor_names()
    }
}

pub struct SafetensorsTensor {
    name: String,
    inner: Arc<SafetensorsWeightManagerInner>,
    file_index: usize,
    data_type: DType,
    shape: Shape
}

impl SafetensorsTensor {
    pub fn new(inner: Arc<SafetensorsWeightManagerInner>, name: String) -> Result<Self, Error> {
        let (file_index, tensor_info) = inner.get_tensor_info(&name).ok_or_else(|| Error::NoSuchTensorError(name.to_string()))?;
        let data_type = DType::from_safetensors(tensor_info.dtype)?;
        let shape = Shape::from(tensor_info.shape.clone());
        Ok(Self {
            name,
            inner,
            file_index,
            data_type,
            shape
        })
    }
}

impl Tensor for SafetensorsTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn gather_weights<'a>(&'a self, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        manager.write_safetensors_tensor_data(self)
    }

    fn get_initializer<'a>(&'a self, name: String, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<TensorProto>, Error> {
        manager.get_initializer(self, name)
    }

    fn parameter_bytes(&self) -> usize {
        self.shape.num_elements().unwrap_or(0) * self.data_type.size_in_bytes()
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}
