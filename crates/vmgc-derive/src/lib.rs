//! Derive macro for the `vmgc::Trace` trait.
//!
//! The generated `trace` hands every field to `Trace::trace`, so reference
//! slots (`vmgc::Ref`) are enqueued by address and plain data is ignored.
//! Fields marked `#[vmgc(skip)]` are left out.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Attribute, Data, DeriveInput, Field,
    Fields, GenericParam, Generics, Ident, Index, Path,
};

#[proc_macro_derive(Trace, attributes(vmgc))]
pub fn derive_trace(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut vmgc: Path = parse_quote!(::vmgc);

    for attr in &input.attrs {
        if !attr.path().is_ident("vmgc") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                vmgc = meta.value()?.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        });

        if let Err(err) = result {
            return err.into_compile_error().into();
        }
    }

    let name = &input.ident;
    let generics = add_trait_bounds(&vmgc, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let trace_body = match generate_trace_body(&vmgc, name, &input.data) {
        Ok(body) => body,
        Err(err) => return err.into_compile_error().into(),
    };

    let generated = quote! {
        unsafe impl #impl_generics #vmgc::Trace for #name #ty_generics #where_clause {
            #[inline]
            fn trace(&mut self, worklist: &mut #vmgc::Worklist) {
                #trace_body
            }
        }
    };

    generated.into()
}

fn add_trait_bounds(vmgc: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_trace = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Trace")
                } else {
                    false
                }
            });

            if !has_trace {
                type_param.bounds.push(parse_quote!(#vmgc::Trace));
            }
        }
    }
    generics
}

/// Whether a field carries `#[vmgc(skip)]`.
fn is_skipped(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut skip = false;
    for attr in attrs {
        if !attr.path().is_ident("vmgc") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute"))
            }
        })?;
    }
    Ok(skip)
}

fn traced_fields<'a>(
    fields: impl Iterator<Item = &'a Field>,
) -> syn::Result<Vec<(usize, &'a Field)>> {
    let mut out = Vec::new();
    for (i, field) in fields.enumerate() {
        if !is_skipped(&field.attrs)? {
            out.push((i, field));
        }
    }
    Ok(out)
}

fn generate_trace_body(vmgc: &Path, name: &Ident, data: &Data) -> syn::Result<TokenStream> {
    match data {
        Data::Struct(data) => generate_struct_trace(vmgc, &data.fields),
        Data::Enum(data) => generate_enum_trace(vmgc, name, data),
        Data::Union(u) => Ok(quote_spanned! {
            u.union_token.span => compile_error!("`Trace` must be manually implemented for unions");
        }),
    }
}

fn generate_struct_trace(vmgc: &Path, fields: &Fields) -> syn::Result<TokenStream> {
    let calls = match fields {
        Fields::Named(f) => traced_fields(f.named.iter())?
            .into_iter()
            .map(|(_, field)| {
                let name = &field.ident;
                quote_spanned! {field.span() =>
                    #vmgc::Trace::trace(&mut self.#name, worklist);
                }
            })
            .collect::<Vec<_>>(),
        Fields::Unnamed(f) => traced_fields(f.unnamed.iter())?
            .into_iter()
            .map(|(i, field)| {
                let index = Index::from(i);
                quote_spanned! {field.span() =>
                    #vmgc::Trace::trace(&mut self.#index, worklist);
                }
            })
            .collect::<Vec<_>>(),
        Fields::Unit => Vec::new(),
    };
    Ok(quote! { #(#calls)* })
}

fn generate_enum_trace(vmgc: &Path, name: &Ident, data: &syn::DataEnum) -> syn::Result<TokenStream> {
    let mut arms = Vec::with_capacity(data.variants.len());
    for variant in &data.variants {
        let var_name = &variant.ident;
        let arm = match &variant.fields {
            Fields::Named(f) => {
                let traced = traced_fields(f.named.iter())?;
                let bindings = traced.iter().map(|(i, field)| {
                    let ident = &field.ident;
                    let binding = format_ident!("field{}", i);
                    quote! { #ident: #binding }
                });
                let calls = traced.iter().map(|(i, _)| {
                    let binding = format_ident!("field{}", i);
                    quote! { #vmgc::Trace::trace(#binding, worklist); }
                });
                quote! {
                    #name::#var_name { #(#bindings,)* .. } => {
                        #(#calls)*
                    }
                }
            }
            Fields::Unnamed(f) => {
                let traced = traced_fields(f.unnamed.iter())?;
                let patterns = (0..f.unnamed.len()).map(|i| {
                    if traced.iter().any(|(t, _)| *t == i) {
                        let binding = format_ident!("field{}", i);
                        quote! { #binding }
                    } else {
                        quote! { _ }
                    }
                });
                let calls = traced.iter().map(|(i, _)| {
                    let binding = format_ident!("field{}", i);
                    quote! { #vmgc::Trace::trace(#binding, worklist); }
                });
                quote! {
                    #name::#var_name(#(#patterns),*) => {
                        #(#calls)*
                    }
                }
            }
            Fields::Unit => quote! {
                #name::#var_name => {}
            },
        };
        arms.push(arm);
    }

    if arms.is_empty() {
        return Ok(quote! {});
    }

    Ok(quote! {
        match self {
            #(#arms)*
        }
    })
}
