//! Vertex binding assignment
//!
//! Attributes with an explicit binding index keep it, and no other attribute
//! is ever folded onto that index. The remaining attributes are grouped by
//! `{stride, input rate, divisor}`; each group gets one binding, numbered
//! from the smallest index nobody claimed explicitly.

use ash::vk;
use std::collections::{BTreeMap, BTreeSet};

use crate::core::error::{contract_violation, CrucibleResult};
use crate::native::{VertexAttributeDesc, VertexBindingDesc};

/// One vertex attribute as declared on a create-info
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader location
    pub location: u32,
    /// Attribute format
    pub format: vk::Format,
    /// Offset inside one element
    pub offset: u32,
    /// Element stride
    pub stride: u32,
    /// Per-vertex or per-instance
    pub input_rate: vk::VertexInputRate,
    /// Binding index requested by the caller
    pub explicit_binding: Option<u32>,
    /// Instance divisor
    pub divisor: u32,
}

impl VertexAttribute {
    /// Whether both attributes can be sourced from the same binding
    pub fn shares_binding_with(&self, other: &Self) -> bool {
        self.stride == other.stride && self.input_rate == other.input_rate && self.divisor == other.divisor
    }
}

/// Bindings and attributes produced for one pipeline
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VertexInputLayout {
    bindings: Vec<VertexBindingDesc>,
    attributes: Vec<VertexAttributeDesc>,
    location_to_binding: BTreeMap<u32, u32>,
}

impl VertexInputLayout {
    /// Assign bindings to `attributes`
    pub fn build(attributes: &[VertexAttribute]) -> CrucibleResult<Self> {
        let reserved: BTreeSet<u32> = attributes.iter().filter_map(|a| a.explicit_binding).collect();

        let mut bindings: BTreeMap<u32, VertexBindingDesc> = BTreeMap::new();
        let mut location_to_binding = BTreeMap::new();

        for (attribute, index) in attributes
            .iter()
            .filter_map(|a| a.explicit_binding.map(|index| (a, index)))
        {
            let binding = binding_for(index, attribute);
            match bindings.get(&index) {
                Some(existing) if *existing != binding => {
                    return Err(contract_violation(format!(
                        "attributes on explicit binding {index} disagree on stride, rate or divisor"
                    )));
                }
                Some(_) => {}
                None => {
                    bindings.insert(index, binding);
                }
            }
            location_to_binding.insert(attribute.location, index);
        }

        let mut implicit: Vec<(VertexAttribute, u32)> = Vec::new();
        let mut next_free = 0u32;
        for attribute in attributes.iter().filter(|a| a.explicit_binding.is_none()) {
            let index = match implicit.iter().find(|(rep, _)| rep.shares_binding_with(attribute)) {
                Some((_, index)) => *index,
                None => {
                    while reserved.contains(&next_free) || bindings.contains_key(&next_free) {
                        next_free += 1;
                    }
                    let index = next_free;
                    bindings.insert(index, binding_for(index, attribute));
                    implicit.push((*attribute, index));
                    index
                }
            };
            location_to_binding.insert(attribute.location, index);
        }

        let mut sorted: Vec<&VertexAttribute> = attributes.iter().collect();
        sorted.sort_by_key(|a| a.location);
        let attributes = sorted
            .into_iter()
            .map(|a| VertexAttributeDesc {
                location: a.location,
                binding: location_to_binding[&a.location],
                format: a.format,
                offset: a.offset,
            })
            .collect();

        Ok(Self {
            bindings: bindings.into_values().collect(),
            attributes,
            location_to_binding,
        })
    }

    /// Bindings ordered by index
    pub fn bindings(&self) -> &[VertexBindingDesc] {
        &self.bindings
    }

    /// Attributes ordered by location
    pub fn attributes(&self) -> &[VertexAttributeDesc] {
        &self.attributes
    }

    /// Binding an attribute location reads from
    pub fn binding_for_location(&self, location: u32) -> Option<u32> {
        self.location_to_binding.get(&location).copied()
    }
}

fn binding_for(index: u32, attribute: &VertexAttribute) -> VertexBindingDesc {
    VertexBindingDesc {
        binding: index,
        stride: attribute.stride,
        input_rate: attribute.input_rate,
        divisor: attribute.divisor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(location: u32, stride: u32, explicit_binding: Option<u32>) -> VertexAttribute {
        VertexAttribute {
            location,
            format: vk::Format::R32G32B32A32_SFLOAT,
            offset: location * 16,
            stride,
            input_rate: vk::VertexInputRate::VERTEX,
            explicit_binding,
            divisor: 1,
        }
    }

    #[test]
    fn test_matching_attributes_share_one_binding() {
        let layout = VertexInputLayout::build(&[attr(0, 32, None), attr(1, 32, None), attr(2, 32, None)]).unwrap();
        assert_eq!(layout.bindings().len(), 1);
        assert!((0..3).all(|l| layout.binding_for_location(l) == Some(0)));
    }

    #[test]
    fn test_explicit_binding_is_never_shared_with_implicit() {
        let layout = VertexInputLayout::build(&[attr(0, 32, None), attr(1, 32, Some(0)), attr(2, 32, None)]).unwrap();
        assert_eq!(layout.binding_for_location(1), Some(0));
        assert_eq!(layout.binding_for_location(0), Some(1));
        assert_eq!(layout.binding_for_location(2), Some(1));
        assert_eq!(layout.bindings().len(), 2);
    }

    #[test]
    fn test_different_rates_split_bindings() {
        let mut instanced = attr(1, 32, None);
        instanced.input_rate = vk::VertexInputRate::INSTANCE;
        let mut divided = instanced;
        divided.location = 2;
        divided.divisor = 4;

        let layout = VertexInputLayout::build(&[attr(0, 32, None), instanced, divided]).unwrap();
        assert_eq!(layout.bindings().len(), 3);
        assert_eq!(layout.bindings()[2].divisor, 4);
    }

    #[test]
    fn test_attributes_sorted_by_location() {
        let layout = VertexInputLayout::build(&[attr(3, 16, None), attr(1, 16, None)]).unwrap();
        let locations: Vec<u32> = layout.attributes().iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![1, 3]);
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_conflicting_explicit_attributes_rejected() {
        assert!(VertexInputLayout::build(&[attr(0, 16, Some(2)), attr(1, 32, Some(2))]).is_err());
    }
}
