//! Derive macro for automatic binary serialization.
//!
//! Generates `Encode` and `Decode` implementations for named-field structs,
//! the only shape the snapshot types take. Other shapes are rejected with a
//! compile error.
//!
//! # Binary Format
//!
//! Fields are serialized in declaration order:
//! - Integers and floats: little-endian, fixed-width
//! - Arrays: elements serialized sequentially, no length prefix
//!
//! The layout of a derived struct is therefore exactly the concatenation of
//! its field layouts, which is what fixed on-disk images rely on.

use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DataStruct, DeriveInput, Fields, parse_macro_input};

/// Derives `Encode` and `Decode` for a named-field struct.
///
/// # Example
///
/// ```ignore
/// use picolin_derive::BinaryCodec;
///
/// #[derive(BinaryCodec)]
/// pub struct VectorSlot {
///     pub size: i32,
///     pub address: i32,
/// }
/// ```
///
/// # Generated Code
///
/// ```ignore
/// impl Encode for VectorSlot {
///     fn encode<S: EncodeSink>(&self, out: &mut S) {
///         self.size.encode(out);
///         self.address.encode(out);
///     }
/// }
///
/// impl Decode for VectorSlot {
///     fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
///         Ok(Self {
///             size: i32::decode(input)?,
///             address: i32::decode(input)?,
///         })
///     }
/// }
/// ```
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let name = &input.ident;
    let generics = &input.generics;
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let expanded = match &input.data {
        Data::Struct(DataStruct {
            fields: Fields::Named(fields),
            ..
        }) => generate_named_struct_impl(name, &impl_generics, &ty_generics, where_clause, fields),
        _ => syn::Error::new_spanned(
            &input,
            "BinaryCodec derive supports only named-field structs",
        )
        .to_compile_error(),
    };

    TokenStream::from(expanded)
}

/// Generates `Encode` and `Decode` for named-field structs.
///
/// Fields are written in declaration order and read back in the same order.
fn generate_named_struct_impl(
    name: &syn::Ident,
    impl_generics: &syn::ImplGenerics,
    ty_generics: &syn::TypeGenerics,
    where_clause: Option<&syn::WhereClause>,
    fields: &syn::FieldsNamed,
) -> proc_macro2::TokenStream {
    let field_names: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();

    let encode_fields = field_names.iter().map(|name| {
        quote! {
            crate::types::encoding::Encode::encode(&self.#name, out);
        }
    });

    let decode_fields = field_names.iter().map(|name| {
        quote! {
            #name: crate::types::encoding::Decode::decode(input)?,
        }
    });

    quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #(#encode_fields)*
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            fn decode(input: &mut &[u8]) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                Ok(Self {
                    #(#decode_fields)*
                })
            }
        }
    }
}
