//! Shader modules and entry points
//!
//! Modules take precompiled SPIR-V; there is no compiler in the loop.

use ash::vk;
use std::path::Path;
use std::sync::Arc;

use crate::core::error::{api_error, contract_violation, CrucibleError, CrucibleResult};
use crate::device::Device;
use crate::foundation::collections::ObjectId;
use crate::native::{ShaderStageDesc, SpecializationDesc, SpecializationEntryDesc};
use crate::registry::{DebugLabel, ObjectKind, Registration};

use super::{impl_debug_named, raw};

/// SPIR-V shader module
pub struct ShaderModule {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::ShaderModule,
    label: DebugLabel,
    _registration: Registration,
}

impl ShaderModule {
    /// Create from SPIR-V words
    pub fn create(device: &Arc<Device>, spirv: &[u32]) -> CrucibleResult<Arc<Self>> {
        if spirv.is_empty() {
            return Err(contract_violation("shader module created from empty SPIR-V"));
        }

        let handle = device
            .native()
            .create_shader_module(spirv)
            .map_err(|e| api_error("create_shader_module", e))?;

        log::trace!("Shader module created ({} words)", spirv.len());

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                label: DebugLabel::for_handle(vk::ObjectType::SHADER_MODULE, raw(handle)),
                _registration: Registration::new(ObjectKind::ShaderModule, id, weak.clone()),
            }
        }))
    }

    /// Create from SPIR-V bytes
    pub fn from_bytes(device: &Arc<Device>, bytes: &[u8]) -> CrucibleResult<Arc<Self>> {
        let words = ash::util::read_spv(&mut std::io::Cursor::new(bytes)).map_err(|e| {
            log::error!("Invalid SPIR-V blob: {}", e);
            CrucibleError::Unsupported(format!("invalid SPIR-V: {e}"))
        })?;
        Self::create(device, &words)
    }

    /// Load SPIR-V from a file
    pub fn from_file(device: &Arc<Device>, path: impl AsRef<Path>) -> CrucibleResult<Arc<Self>> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            log::error!("Failed to read shader {}: {}", path.display(), e);
            CrucibleError::ResourceNotFound {
                what: format!("shader file {}", path.display()),
            }
        })?;
        Self::from_bytes(device, &bytes)
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }
}

impl_debug_named!(ShaderModule);

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShaderModule({}, {:?})", self.id, self.handle)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.device.native().destroy_shader_module(self.handle);
    }
}

/// Graphics shader stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    /// Vertex shader
    Vertex,
    /// Tessellation control shader
    TessellationControl,
    /// Tessellation evaluation shader
    TessellationEvaluation,
    /// Geometry shader
    Geometry,
    /// Fragment shader
    Fragment,
}

impl ShaderStage {
    /// All graphics stages in pipeline order
    pub const ALL: [Self; 5] = [
        Self::Vertex,
        Self::TessellationControl,
        Self::TessellationEvaluation,
        Self::Geometry,
        Self::Fragment,
    ];

    /// Native stage bit
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// One specialization constant value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecializationConstant {
    /// Constant ID in the shader
    pub constant_id: u32,
    /// Raw little-endian value
    pub data: Vec<u8>,
}

/// Module + entry point name + specialization constants
#[derive(Clone)]
pub struct ShaderEntryPoint {
    module: Arc<ShaderModule>,
    name: String,
    constants: Vec<SpecializationConstant>,
}

impl ShaderEntryPoint {
    /// Entry point `name` of `module`
    pub fn new(module: &Arc<ShaderModule>, name: impl Into<String>) -> Self {
        Self {
            module: Arc::clone(module),
            name: name.into(),
            constants: Vec::new(),
        }
    }

    /// Set a specialization constant; a repeated ID overwrites the value
    pub fn with_constant<T: bytemuck::Pod>(mut self, constant_id: u32, value: T) -> Self {
        let data = bytemuck::bytes_of(&value).to_vec();
        match self.constants.iter_mut().find(|c| c.constant_id == constant_id) {
            Some(existing) => existing.data = data,
            None => self.constants.push(SpecializationConstant { constant_id, data }),
        }
        self
    }

    /// Shader module
    pub fn module(&self) -> &Arc<ShaderModule> {
        &self.module
    }

    /// Entry point name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Specialization constants in insertion order
    pub fn constants(&self) -> &[SpecializationConstant] {
        &self.constants
    }

    pub(crate) fn to_stage_desc(&self, stage: ShaderStage) -> ShaderStageDesc {
        let specialization = (!self.constants.is_empty()).then(|| {
            let mut desc = SpecializationDesc::default();
            for constant in &self.constants {
                desc.entries.push(SpecializationEntryDesc {
                    constant_id: constant.constant_id,
                    offset: desc.data.len() as u32,
                    size: constant.data.len(),
                });
                desc.data.extend_from_slice(&constant.data);
            }
            desc
        });

        ShaderStageDesc {
            stage: stage.to_vk(),
            module: self.module.handle(),
            entry_point: self.name.clone(),
            specialization,
        }
    }
}

impl PartialEq for ShaderEntryPoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.module, &other.module)
            && self.name == other.name
            && self.constants == other.constants
    }
}

impl std::fmt::Debug for ShaderEntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderEntryPoint")
            .field("module", &self.module.id())
            .field("name", &self.name)
            .field("constants", &self.constants.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameworkConfig;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn test_specialization_constants_pack_in_order() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let module = ShaderModule::create(&device, &[SPIRV_MAGIC, 0, 0, 0, 0]).unwrap();
        let entry = ShaderEntryPoint::new(&module, "main")
            .with_constant(3, 1.5f32)
            .with_constant(0, 7u32)
            .with_constant(3, 2.0f32);

        let desc = entry.to_stage_desc(ShaderStage::Fragment);
        assert_eq!(desc.stage, vk::ShaderStageFlags::FRAGMENT);
        let spec = desc.specialization.unwrap();
        assert_eq!(spec.entries.len(), 2);
        assert_eq!(spec.entries[0].constant_id, 3);
        assert_eq!(spec.entries[1].offset, 4);
        assert_eq!(&spec.data[..4], &2.0f32.to_le_bytes());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_empty_spirv_is_rejected() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        assert!(ShaderModule::create(&device, &[]).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_from_bytes_reads_words() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let bytes: Vec<u8> = [SPIRV_MAGIC, 0x0001_0000]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        assert!(ShaderModule::from_bytes(&device, &bytes).is_ok());
        assert!(ShaderModule::from_bytes(&device, &bytes[..3]).is_err());
    }
}
