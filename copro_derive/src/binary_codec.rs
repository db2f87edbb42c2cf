//! Derive macro for the wire codec.
//!
//! Generates `Encode` and `Decode` implementations for structs and enums.
//!
//! # Supported Types
//!
//! - **Named structs**: `struct FrameHeader { magic: u32, version: u16, .. }`
//! - **Tuple structs**: `struct Seq(u32)`
//! - **Unit structs**: `struct Ack`
//! - **Enums**: `enum Status { Ok = 0, Param = -4 }`, optionally with fields
//!
//! Unions are not supported.
//!
//! # Binary Format
//!
//! Fields are serialized in declaration order with no padding:
//! - Integers: little-endian, fixed-width
//! - Arrays: elements serialized sequentially
//! - Enum tags: `u8` unless the container carries `#[binary_codec(repr = "...")]`
//!
//! The layout matches a packed little-endian C struct, which is what the
//! co-processor firmware puts on the wire.

use proc_macro::TokenStream;
use proc_macro2::{Literal, Span};
use quote::quote;
use syn::{Data, DataEnum, DeriveInput, Fields, parse_macro_input};

const TAG_TYPES: [&str; 6] = ["u8", "u16", "u32", "i8", "i16", "i32"];

/// Derives `Encode` and `Decode` for a type.
///
/// # Example
///
/// ```ignore
/// use copro_derive::BinaryCodec;
///
/// #[derive(BinaryCodec)]
/// #[binary_codec(repr = "u16")]
/// pub enum Command {
///     Hello = 0x01,
///     Info = 0x02,
/// }
/// ```
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = match &input.data {
        Data::Struct(data_struct) => {
            let (encode_body, decode_body) = match &data_struct.fields {
                Fields::Named(fields) => {
                    let names: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                    (
                        quote! {
                            #( crate::types::encoding::Encode::encode(&self.#names, out); )*
                        },
                        quote! {
                            Ok(Self {
                                #( #names: crate::types::encoding::Decode::decode(input)?, )*
                            })
                        },
                    )
                }
                Fields::Unnamed(fields) => {
                    let indices: Vec<_> = (0..fields.unnamed.len()).map(syn::Index::from).collect();
                    let reads = indices.iter().map(|_| {
                        quote! { crate::types::encoding::Decode::decode(input)?, }
                    });
                    (
                        quote! {
                            #( crate::types::encoding::Encode::encode(&self.#indices, out); )*
                        },
                        quote! { Ok(Self( #(#reads)* )) },
                    )
                }
                Fields::Unit => (quote! { let _ = out; }, quote! { let _ = input; Ok(Self) }),
            };

            quote! {
                impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
                    fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                        #encode_body
                    }
                }

                impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
                    fn decode(input: &mut &[u8]) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                        #decode_body
                    }
                }
            }
        }
        Data::Enum(data_enum) => match enum_impl(&input, data_enum) {
            Ok(tokens) => tokens,
            Err(err) => err.to_compile_error(),
        },
        Data::Union(_) => {
            syn::Error::new_spanned(&input, "BinaryCodec derive does not support unions")
                .to_compile_error()
        }
    };

    TokenStream::from(expanded)
}

/// Generates `Encode` and `Decode` for enums.
///
/// The tag is written with the container's `repr` type, followed by the
/// variant's fields in declaration order.
fn enum_impl(input: &DeriveInput, data_enum: &DataEnum) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let repr = tag_type(&input.attrs)?;
    let discriminants = compute_discriminants(data_enum)?;

    let mut encode_arms = Vec::with_capacity(discriminants.len());
    let mut decode_arms = Vec::with_capacity(discriminants.len());

    for (variant, &value) in data_enum.variants.iter().zip(discriminants.iter()) {
        let variant_name = &variant.ident;
        let tag = tag_literal(value);

        match &variant.fields {
            Fields::Unit => {
                encode_arms.push(quote! {
                    Self::#variant_name => {
                        let tag: #repr = #tag;
                        crate::types::encoding::Encode::encode(&tag, out);
                    }
                });
                decode_arms.push(quote! { #tag => Ok(Self::#variant_name), });
            }
            Fields::Unnamed(fields) => {
                let idents: Vec<_> = (0..fields.unnamed.len())
                    .map(|i| quote::format_ident!("f{}", i))
                    .collect();
                let reads = idents.iter().map(|_| {
                    quote! { crate::types::encoding::Decode::decode(input)?, }
                });
                encode_arms.push(quote! {
                    Self::#variant_name(#(#idents),*) => {
                        let tag: #repr = #tag;
                        crate::types::encoding::Encode::encode(&tag, out);
                        #( crate::types::encoding::Encode::encode(#idents, out); )*
                    }
                });
                decode_arms.push(quote! { #tag => Ok(Self::#variant_name(#(#reads)*)), });
            }
            Fields::Named(fields) => {
                let idents: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                encode_arms.push(quote! {
                    Self::#variant_name { #(#idents),* } => {
                        let tag: #repr = #tag;
                        crate::types::encoding::Encode::encode(&tag, out);
                        #( crate::types::encoding::Encode::encode(#idents, out); )*
                    }
                });
                decode_arms.push(quote! {
                    #tag => Ok(Self::#variant_name {
                        #( #idents: crate::types::encoding::Decode::decode(input)?, )*
                    }),
                });
            }
        }
    }

    Ok(quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                match self {
                    #(#encode_arms)*
                }
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            fn decode(input: &mut &[u8]) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                let tag: #repr = crate::types::encoding::Decode::decode(input)?;
                match tag {
                    #(#decode_arms)*
                    _ => Err(crate::types::encoding::DecodeError::InvalidValue),
                }
            }
        }
    })
}

/// Reads `#[binary_codec(repr = "u16")]`, defaulting to `u8`.
fn tag_type(attrs: &[syn::Attribute]) -> syn::Result<syn::Ident> {
    let mut repr = String::from("u8");

    for attr in attrs.iter().filter(|a| a.path().is_ident("binary_codec")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("repr") {
                let lit: syn::LitStr = meta.value()?.parse()?;
                repr = lit.value();
                Ok(())
            } else {
                Err(meta.error("unsupported binary_codec option; expected `repr = \"...\"`"))
            }
        })?;
    }

    if !TAG_TYPES.contains(&repr.as_str()) {
        return Err(syn::Error::new(
            Span::call_site(),
            format!("binary_codec repr must be one of {TAG_TYPES:?}, got `{repr}`"),
        ));
    }
    Ok(syn::Ident::new(&repr, Span::call_site()))
}

/// Emits a tag value as tokens usable both as an expression and as a pattern.
fn tag_literal(value: i64) -> proc_macro2::TokenStream {
    let magnitude = Literal::u64_unsuffixed(value.unsigned_abs());
    if value < 0 {
        quote! { -#magnitude }
    } else {
        quote! { #magnitude }
    }
}

/// Computes discriminant values for each enum variant.
///
/// Follows Rust's discriminant rules: explicit values are used as written,
/// implicit ones continue from the previous variant, the first defaults to 0.
fn compute_discriminants(data_enum: &DataEnum) -> syn::Result<Vec<i64>> {
    let mut discriminants = Vec::with_capacity(data_enum.variants.len());
    let mut next: i64 = 0;

    for variant in &data_enum.variants {
        let value = match &variant.discriminant {
            Some((_, expr)) => parse_discriminant_expr(expr)?,
            None => next,
        };
        discriminants.push(value);
        next = value.wrapping_add(1);
    }

    Ok(discriminants)
}

/// Parses integer literal discriminants, including negative and hex forms.
fn parse_discriminant_expr(expr: &syn::Expr) -> syn::Result<i64> {
    match expr {
        syn::Expr::Lit(syn::ExprLit {
            lit: syn::Lit::Int(lit_int),
            ..
        }) => lit_int.base10_parse::<i64>(),
        syn::Expr::Unary(syn::ExprUnary {
            op: syn::UnOp::Neg(_),
            expr,
            ..
        }) => parse_discriminant_expr(expr).map(|v| -v),
        syn::Expr::Group(group) => parse_discriminant_expr(&group.expr),
        _ => Err(syn::Error::new_spanned(
            expr,
            "discriminant must be an integer literal",
        )),
    }
}
