//! Helper macros for `privd`

use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemEnum, Lit, Meta, MetaNameValue, Variant};

/// Derive the operation names and scopes of a request enum.
///
/// Every variant becomes one named operation.  The name defaults to
/// the camel-cased variant name and can be overridden with
/// `#[name = "..."]`.  Variants marked with `#[run_as]` are
/// identity-scoped and must be executed in a privilege-dropped
/// worker.
#[proc_macro_derive(Operation, attributes(name, run_as))]
pub fn derive_operation(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(item as ItemEnum);

    derive_operation_enum(input).into()
}

fn derive_operation_enum(item: ItemEnum) -> TokenStream {
    let ident = item.ident.clone();
    let mut to_name = vec![];
    let mut identity_scoped = vec![];

    for variant in item.variants.iter() {
        let ident = &variant.ident;
        let name =
            variant_name(variant).unwrap_or_else(|| ident.to_string().to_case(Case::Camel));
        let run_as = variant
            .attrs
            .iter()
            .any(|attr| attr.path.is_ident("run_as"));

        to_name.push(quote! {
            Self::#ident { .. } => #name,
        });

        identity_scoped.push(quote! {
            Self::#ident { .. } => #run_as,
        });
    }

    quote! {
        impl #ident {
            /// The operation name as exposed to callers.
            pub fn name(&self) -> &'static str {
                match self {
                    #(#to_name)*
                }
            }

            /// Returns true if the operation runs under a caller-supplied identity.
            pub fn is_identity_scoped(&self) -> bool {
                match self {
                    #(#identity_scoped)*
                }
            }
        }
    }
}

fn variant_name(variant: &Variant) -> Option<String> {
    variant
        .attrs
        .iter()
        .filter(|attr| attr.path.is_ident("name"))
        .find_map(|attr| match attr.parse_meta().ok()? {
            Meta::NameValue(MetaNameValue {
                lit: Lit::Str(name),
                ..
            }) => Some(name.value()),
            _ => None,
        })
}
