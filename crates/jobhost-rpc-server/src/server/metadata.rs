//! Function metadata handed over by the indexing layer.

use jobhost_rpc_core::proto::{BindingInfo, RpcFunctionMetadata, binding_info};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMetadata {
    pub name: String,
    /// Defaults to `name` when the manifest leaves it out.
    #[serde(default)]
    pub function_id: String,
    /// Worker runtime that executes the function. Resolved from the script
    /// extension when absent.
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub script_file: String,
    #[serde(default)]
    pub entry_point: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub bindings: Vec<BindingMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub binding_type: String,
    #[serde(default)]
    pub direction: BindingDirection,
    #[serde(default)]
    pub data_type: Option<BindingDataType>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingDirection {
    #[default]
    In,
    Out,
    #[serde(alias = "inOut")]
    InOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingDataType {
    String,
    Binary,
    Stream,
}

impl FunctionMetadata {
    pub fn language(&self) -> &str {
        self.language.as_deref().unwrap_or_default()
    }

    /// Extension of the script file, lowercased and with its leading dot.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.script_file)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
    }

    pub fn to_rpc(&self) -> RpcFunctionMetadata {
        RpcFunctionMetadata {
            name: self.name.clone(),
            directory: self.directory.clone(),
            script_file: self.script_file.clone(),
            entry_point: self.entry_point.clone(),
            bindings: self
                .bindings
                .iter()
                .map(|binding| (binding.name.clone(), binding.to_rpc()))
                .collect(),
        }
    }
}

impl BindingMetadata {
    fn to_rpc(&self) -> BindingInfo {
        let direction = match self.direction {
            BindingDirection::In => binding_info::Direction::In,
            BindingDirection::Out => binding_info::Direction::Out,
            BindingDirection::InOut => binding_info::Direction::Inout,
        };
        let data_type = match self.data_type {
            None => binding_info::DataType::Undefined,
            Some(BindingDataType::String) => binding_info::DataType::String,
            Some(BindingDataType::Binary) => binding_info::DataType::Binary,
            Some(BindingDataType::Stream) => binding_info::DataType::Stream,
        };
        BindingInfo {
            r#type: self.binding_type.clone(),
            direction: direction as i32,
            data_type: data_type as i32,
        }
    }
}
