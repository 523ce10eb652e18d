//! Procedural derive macros for linerec.
//!
//! This crate provides the `ConfigValidator` derive used by the model
//! configuration structs in `linerec-core` and `linerec-nn`.

use darling::{FromDeriveInput, FromField, FromMeta, ast};
use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, Expr, Type, parse_macro_input};

/// Parsed arguments for range validators: `range(min, max)` or `optional_range(min, max)`
#[derive(Debug, FromMeta)]
struct RangeArgs {
    min: Expr,
    max: Expr,
}

/// All supported validators that can be applied to a field.
#[derive(Debug, Default, FromMeta)]
struct Validators {
    /// `#[validate(range(min = expr, max = expr))]` - value must be in [min, max]
    #[darling(default)]
    range: Option<RangeArgs>,

    /// `#[validate(min = expr)]` - value must be >= expr
    #[darling(default)]
    min: Option<Expr>,

    /// `#[validate(max = expr)]` - value must be <= expr
    #[darling(default)]
    max: Option<Expr>,

    /// `#[validate(optional_range(min = expr, max = expr))]` - for Option<T> fields
    #[darling(default)]
    optional_range: Option<RangeArgs>,

    /// `#[validate(even)]` - integer value must be divisible by two
    #[darling(default)]
    even: bool,
}

/// A single field with its validation rules.
#[derive(Debug, FromField)]
#[darling(attributes(validate))]
struct ValidatedField {
    ident: Option<syn::Ident>,
    #[allow(dead_code)]
    ty: Type,
    #[darling(flatten)]
    validators: Validators,
}

/// The input struct for ConfigValidator derive.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(validate), supports(struct_named))]
struct ConfigValidatorInput {
    ident: syn::Ident,
    data: ast::Data<(), ValidatedField>,
}

/// Derive macro for implementing the `ConfigValidator` trait.
///
/// Validation rules are specified using the `#[validate(...)]` attribute on fields.
/// The generated code refers to `::linerec_core`, so the deriving crate must depend
/// on `linerec-core`.
///
/// # Supported Validators
///
/// - `#[validate(range(min = value, max = value))]` - field value is within [min, max]
/// - `#[validate(min = value)]` - field value is at least `value`
/// - `#[validate(max = value)]` - field value is at most `value`
/// - `#[validate(optional_range(min = value, max = value))]` - like `range`, for `Option<T>` fields
/// - `#[validate(even)]` - integer field is a multiple of two
///
/// # Example
///
/// ```rust,ignore
/// use linerec_core::ConfigValidator;
///
/// #[derive(ConfigValidator, Default)]
/// pub struct DecoderConfig {
///     #[validate(min = 2, even)]
///     pub tf_dim: usize,
///
///     #[validate(range(min = 0.0, max = 1.0))]
///     pub tf_dropout: f32,
///
///     // Fields without #[validate] are not validated
///     pub tf_layers: usize,
/// }
/// ```
#[proc_macro_derive(ConfigValidator, attributes(validate))]
pub fn derive_config_validator(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    ConfigValidatorInput::from_derive_input(&input)
        .and_then(|parsed| generate_config_validator(&parsed))
        .unwrap_or_else(|err| err.write_errors())
        .into()
}

fn generate_config_validator(
    input: &ConfigValidatorInput,
) -> darling::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    let fields = input
        .data
        .as_ref()
        .take_struct()
        .ok_or_else(|| darling::Error::unsupported_shape("only named structs are supported"))?;

    let validations: Vec<_> = fields
        .iter()
        .filter_map(|field| generate_field_validation(field))
        .collect();

    Ok(quote! {
        impl ::linerec_core::core::config::ConfigValidator for #name {
            fn validate(&self) -> Result<(), ::linerec_core::core::config::ConfigError> {
                #(#validations)*
                Ok(())
            }

            fn get_defaults() -> Self
            where
                Self: Sized,
            {
                Self::default()
            }
        }
    })
}

fn generate_field_validation(field: &ValidatedField) -> Option<proc_macro2::TokenStream> {
    let field_name = field.ident.as_ref()?;
    let field_name_str = field_name.to_string();
    let validators = &field.validators;

    let mut validations = Vec::new();

    if let Some(range) = &validators.range {
        let min_expr = &range.min;
        let max_expr = &range.max;
        validations.push(quote! {
            if !(#min_expr..=#max_expr).contains(&self.#field_name) {
                return Err(::linerec_core::core::config::ConfigError::InvalidConfig {
                    message: format!(
                        "{} must be between {} and {}, got {}",
                        #field_name_str,
                        #min_expr,
                        #max_expr,
                        self.#field_name
                    ),
                });
            }
        });
    }

    if let Some(min_expr) = &validators.min {
        validations.push(quote! {
            if self.#field_name < #min_expr {
                return Err(::linerec_core::core::config::ConfigError::InvalidConfig {
                    message: format!(
                        "{} must be at least {}, got {}",
                        #field_name_str,
                        #min_expr,
                        self.#field_name
                    ),
                });
            }
        });
    }

    if let Some(max_expr) = &validators.max {
        validations.push(quote! {
            if self.#field_name > #max_expr {
                return Err(::linerec_core::core::config::ConfigError::InvalidConfig {
                    message: format!(
                        "{} must be at most {}, got {}",
                        #field_name_str,
                        #max_expr,
                        self.#field_name
                    ),
                });
            }
        });
    }

    if let Some(range) = &validators.optional_range {
        let min_expr = &range.min;
        let max_expr = &range.max;
        validations.push(quote! {
            if let Some(value) = self.#field_name {
                if !(#min_expr..=#max_expr).contains(&value) {
                    return Err(::linerec_core::core::config::ConfigError::InvalidConfig {
                        message: format!(
                            "{} must be between {} and {}, got {}",
                            #field_name_str,
                            #min_expr,
                            #max_expr,
                            value
                        ),
                    });
                }
            }
        });
    }

    if validators.even {
        validations.push(quote! {
            if self.#field_name % 2 != 0 {
                return Err(::linerec_core::core::config::ConfigError::InvalidConfig {
                    message: format!(
                        "{} must be even, got {}",
                        #field_name_str,
                        self.#field_name
                    ),
                });
            }
        });
    }

    if validations.is_empty() {
        None
    } else {
        Some(quote! { #(#validations)* })
    }
}
