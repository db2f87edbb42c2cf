//! Derive macro for error types.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations, and a
//! `From` conversion for every single-field tuple variant whose field carries `#[from]`.
//!
//! # Usage
//!
//! ```ignore
//! use copro_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum RpcError {
//!     #[error("link i/o failed: {0}")]
//!     Io(#[from] std::io::Error),
//!
//!     #[error("response cmd {actual:#x} does not answer {expected:#x}")]
//!     BadResponse { expected: u16, actual: u16 },
//!
//!     #[error("request timed out")]
//!     Timeout,
//! }
//! ```

use proc_macro::TokenStream;
use quote::{ToTokens, quote};
use syn::{Data, DeriveInput, Fields, Lit, Meta, parse_macro_input};

/// Derives `Display`, `Error` and `#[from]` conversions for an enum or struct.
///
/// Every enum variant (or the struct itself) must have an `#[error("...")]`
/// attribute. `{0}`, `{1}` refer to tuple fields, `{name}` to named fields;
/// format specs such as `{0:#x}` are preserved.
pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand_error_derive(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_error_derive(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    match &input.data {
        Data::Enum(data_enum) => {
            let mut display_arms = Vec::with_capacity(data_enum.variants.len());
            let mut from_impls = Vec::new();

            for variant in &data_enum.variants {
                let variant_name = &variant.ident;
                let error_msg = extract_error_message(
                    &variant.attrs,
                    &variant.ident,
                    &format!("variant `{}`", variant.ident),
                )?;

                let arm = match &variant.fields {
                    Fields::Unit => quote! {
                        Self::#variant_name => write!(f, #error_msg),
                    },
                    Fields::Unnamed(fields) => {
                        let idents: Vec<_> = (0..fields.unnamed.len())
                            .map(|i| quote::format_ident!("f{}", i))
                            .collect();
                        let format_str = positional_to_named(&error_msg, fields.unnamed.len());

                        if let Some(source_ty) = from_field(fields)? {
                            from_impls.push(quote! {
                                impl #impl_generics ::std::convert::From<#source_ty> for #name #ty_generics #where_clause {
                                    fn from(source: #source_ty) -> Self {
                                        Self::#variant_name(source)
                                    }
                                }
                            });
                        }

                        let used: Vec<_> = idents
                            .iter()
                            .filter(|i| mentions_field(&format_str, &i.to_string()))
                            .collect();

                        quote! {
                            #[allow(unused_variables)]
                            Self::#variant_name(#(#idents),*) => write!(f, #format_str, #(#used = #used),*),
                        }
                    }
                    Fields::Named(fields) => {
                        let idents: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                        let used: Vec<_> = idents
                            .iter()
                            .filter(|ident| {
                                ident
                                    .as_ref()
                                    .map(|i| mentions_field(&error_msg, &i.to_string()))
                                    .unwrap_or(false)
                            })
                            .collect();
                        quote! {
                            #[allow(unused_variables)]
                            Self::#variant_name { #(#idents),* } => write!(f, #error_msg, #(#used = #used),*),
                        }
                    }
                };
                display_arms.push(arm);
            }

            Ok(quote! {
                impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
                    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                        match self {
                            #(#display_arms)*
                        }
                    }
                }

                impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}

                #(#from_impls)*
            })
        }
        Data::Struct(data_struct) => {
            let error_msg =
                extract_error_message(&input.attrs, &input.ident, &format!("type `{}`", name))?;

            let display_body = match &data_struct.fields {
                Fields::Unit => quote! { write!(f, #error_msg) },
                Fields::Named(fields) => {
                    let used: Vec<_> = fields
                        .named
                        .iter()
                        .filter_map(|f| f.ident.as_ref())
                        .filter(|i| mentions_field(&error_msg, &i.to_string()))
                        .collect();
                    quote! { write!(f, #error_msg, #(#used = self.#used),*) }
                }
                Fields::Unnamed(fields) => {
                    let idents: Vec<_> = (0..fields.unnamed.len())
                        .map(|i| quote::format_ident!("f{}", i))
                        .collect();
                    let indices: Vec<_> = (0..fields.unnamed.len()).map(syn::Index::from).collect();
                    let format_str = positional_to_named(&error_msg, fields.unnamed.len());
                    let used: Vec<_> = idents
                        .iter()
                        .filter(|i| mentions_field(&format_str, &i.to_string()))
                        .collect();
                    quote! {
                        #[allow(unused_variables)]
                        let (#(#idents),*) = (#(&self.#indices),*);
                        write!(f, #format_str, #(#used = #used),*)
                    }
                }
            };

            Ok(quote! {
                impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
                    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                        #display_body
                    }
                }

                impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
            })
        }
        Data::Union(_) => Err(syn::Error::new_spanned(
            input,
            "Error derive does not support unions",
        )),
    }
}

/// Returns the field type when a single-field tuple variant is marked `#[from]`.
fn from_field(fields: &syn::FieldsUnnamed) -> syn::Result<Option<&syn::Type>> {
    let marked: Vec<_> = fields
        .unnamed
        .iter()
        .filter(|f| f.attrs.iter().any(|a| a.path().is_ident("from")))
        .collect();

    match (marked.len(), fields.unnamed.len()) {
        (0, _) => Ok(None),
        (1, 1) => Ok(Some(&marked[0].ty)),
        _ => Err(syn::Error::new_spanned(
            marked[0],
            "#[from] is only supported on a variant with exactly one field",
        )),
    }
}

/// Checks whether a format string references `{name}` or `{name:spec}`.
fn mentions_field(format_str: &str, name: &str) -> bool {
    format_str.contains(&format!("{{{name}}}")) || format_str.contains(&format!("{{{name}:"))
}

/// Extracts the message from an `#[error("...")]` attribute.
fn extract_error_message<T: ToTokens>(
    attrs: &[syn::Attribute],
    target: &T,
    target_desc: &str,
) -> syn::Result<String> {
    for attr in attrs {
        if !attr.path().is_ident("error") {
            continue;
        }
        let Meta::List(meta_list) = &attr.meta else {
            return Err(syn::Error::new_spanned(
                &attr.meta,
                "invalid #[error] attribute; use #[error(\"message\")]",
            ));
        };
        return match syn::parse2::<Lit>(meta_list.tokens.clone()) {
            Ok(Lit::Str(lit_str)) => Ok(lit_str.value()),
            _ => Err(syn::Error::new_spanned(
                &attr.meta,
                "#[error] expects a string literal, e.g. #[error(\"bad status: {0}\")]",
            )),
        };
    }

    Err(syn::Error::new_spanned(
        target,
        format!("missing #[error(\"...\")] attribute on {target_desc}"),
    ))
}

/// Rewrites positional args `{0}`, `{1:x}` to named args `{f0}`, `{f1:x}`.
fn positional_to_named(format_str: &str, field_count: usize) -> String {
    let mut result = format_str.to_string();
    for i in (0..field_count).rev() {
        result = result
            .replace(&format!("{{{i}}}"), &format!("{{f{i}}}"))
            .replace(&format!("{{{i}:"), &format!("{{f{i}:"));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_args_are_renamed() {
        assert_eq!(positional_to_named("a {0} b {1:#x}", 2), "a {f0} b {f1:#x}");
    }

    #[test]
    fn field_mentions_with_format_spec() {
        assert!(mentions_field("got {actual:#x}", "actual"));
        assert!(mentions_field("got {actual}", "actual"));
        assert!(!mentions_field("got {expected}", "actual"));
    }
}
