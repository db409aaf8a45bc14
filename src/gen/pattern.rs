//! Pattern test and binding lowering.
//!
//! A pattern test jumps to the fail label when the scrutinee does not match
//! structurally; bindings then extract sub-values into named locals.
//! Wildcards and plain identifiers always match. Enum variants compare the
//! runtime tag word at the front of the value; `Option` and `Result` carry
//! their well-known tags, user-defined enums the declaration-order index
//! assigned by the semantic analyzer.

use super::ast::{Pattern, PrimitiveKind, TypeInfo};
use super::CodeGenerator;
use crate::core::error::{CodegenError, CodegenResult};
use crate::inst::{Instruction, Opcode, Operand};
use crate::target::PhysReg;

/// Well-known tag values for the built-in sum types.
pub const OPTION_TAG_SOME: u32 = 0;
pub const OPTION_TAG_NONE: u32 = 1;
pub const RESULT_TAG_OK: u32 = 0;
pub const RESULT_TAG_ERR: u32 = 1;

/// Byte offset of an enum's payload word, after the leading tag.
const ENUM_PAYLOAD_OFFSET: i32 = 4;

/// Resolve the runtime tag a variant pattern compares against.
pub fn variant_tag(
    enum_name: &str,
    variant: &str,
    variant_index: Option<u32>,
) -> CodegenResult<u32> {
    match (enum_name, variant) {
        ("Option", "Some") => Ok(OPTION_TAG_SOME),
        ("Option", "None") => Ok(OPTION_TAG_NONE),
        ("Result", "Ok") => Ok(RESULT_TAG_OK),
        ("Result", "Err") => Ok(RESULT_TAG_ERR),
        ("Option" | "Result", other) => Err(CodegenError::unsupported(format!(
            "unknown {enum_name} variant `{other}`"
        ))),
        _ => variant_index.ok_or_else(|| {
            CodegenError::unsupported(format!(
                "enum pattern {enum_name}::{variant} without a resolved variant index"
            ))
        }),
    }
}

impl<'s, 'arena> CodeGenerator<'s, 'arena> {
    /// Test `value_reg` against `pattern`, jumping to `fail_label` when it
    /// does not match. Falls through on a match.
    pub(crate) fn generate_pattern_test(
        &mut self,
        pattern: &Pattern,
        value_reg: PhysReg,
        fail_label: &str,
    ) -> CodegenResult<()> {
        match pattern {
            // Wildcards and identifier patterns always match.
            Pattern::Wildcard | Pattern::Binding(_) => Ok(()),

            Pattern::IntLiteral(expected) => {
                self.emit(Instruction::cmp(
                    Operand::Register(value_reg),
                    Operand::Immediate(*expected),
                )?);
                self.emit(Instruction::jump_cc(Opcode::Jne, fail_label)?);
                Ok(())
            }

            Pattern::EnumVariant { enum_name, variant, variant_index, .. } => {
                let expected = variant_tag(enum_name, variant, *variant_index)?;
                // The tag word sits at the front of the enum value.
                let tag_reg = self.allocate_reg()?;
                self.emit(Instruction::load(tag_reg, value_reg, 0)?);
                self.emit(Instruction::cmp(
                    Operand::Register(tag_reg),
                    Operand::Immediate(expected as i64),
                )?);
                self.free_reg(tag_reg);
                self.emit(Instruction::jump_cc(Opcode::Jne, fail_label)?);
                Ok(())
            }

            // Struct patterns are accepted structurally; the semantic
            // analyzer guaranteed the type matches.
            Pattern::Struct { .. } => Ok(()),
        }
    }

    /// Bind the names a matched pattern introduces.
    pub(crate) fn generate_pattern_bindings(
        &mut self,
        pattern: &Pattern,
        value_reg: PhysReg,
    ) -> CodegenResult<()> {
        match pattern {
            Pattern::Wildcard | Pattern::IntLiteral(_) => Ok(()),

            Pattern::Binding(name) => {
                let offset =
                    self.create_local(name, TypeInfo::primitive(PrimitiveKind::I64));
                let fp = self.abi.frame_pointer;
                self.emit(Instruction::store(fp, offset, value_reg)?);
                Ok(())
            }

            Pattern::EnumVariant { binding, .. } => {
                if let Some(name) = binding {
                    let data_reg = self.allocate_reg()?;
                    self.emit(Instruction::load(
                        data_reg,
                        value_reg,
                        ENUM_PAYLOAD_OFFSET,
                    )?);
                    let offset =
                        self.create_local(name, TypeInfo::primitive(PrimitiveKind::I64));
                    let fp = self.abi.frame_pointer;
                    self.emit(Instruction::store(fp, offset, data_reg)?);
                    self.free_reg(data_reg);
                }
                Ok(())
            }

            Pattern::Struct { name, fields } => {
                if fields.is_empty() {
                    return Ok(());
                }
                // Deliberately an error: silently accepting the pattern
                // without extracting fields would generate wrong code.
                Err(CodegenError::unsupported(format!(
                    "struct pattern field destructuring in `{name}`"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tags() {
        assert_eq!(variant_tag("Option", "Some", None).unwrap(), OPTION_TAG_SOME);
        assert_eq!(variant_tag("Option", "None", None).unwrap(), OPTION_TAG_NONE);
        assert_eq!(variant_tag("Result", "Ok", None).unwrap(), RESULT_TAG_OK);
        assert_eq!(variant_tag("Result", "Err", None).unwrap(), RESULT_TAG_ERR);
        assert!(variant_tag("Option", "Okay", None).is_err());
    }

    #[test]
    fn test_user_enum_tags_are_declaration_indices() {
        // Variants of the same enum carry distinct sequential tags from the
        // semantic analyzer.
        assert_eq!(variant_tag("Shape", "Circle", Some(0)).unwrap(), 0);
        assert_eq!(variant_tag("Shape", "Square", Some(1)).unwrap(), 1);
        // An unresolved index is a reportable error, not a silent guess.
        assert!(variant_tag("Shape", "Triangle", None).is_err());
    }
}
