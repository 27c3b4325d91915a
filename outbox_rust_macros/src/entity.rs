use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Ident, LitStr};

pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let attrs = match parse_struct_attrs(&input) {
        Ok(attrs) => attrs,
        Err(err) => return err.to_compile_error().into(),
    };
    let kind = attrs
        .kind
        .unwrap_or_else(|| format!("{}s", to_snake_case(&name.to_string())));
    let id_field = match find_id_field(&input, attrs.id) {
        Ok(field) => field,
        Err(err) => return err.to_compile_error().into(),
    };

    let expanded = quote! {
        impl #impl_generics ::outbox_rust::Entity for #name #ty_generics #where_clause {
            const KIND: &'static str = #kind;

            fn entity_id(&self) -> String {
                self.#id_field.to_string()
            }
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct StructAttrs {
    kind: Option<String>,
    id: Option<String>,
}

fn parse_struct_attrs(input: &DeriveInput) -> syn::Result<StructAttrs> {
    let mut attrs = StructAttrs::default();
    for attr in &input.attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("kind") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.kind = Some(value.value());
            } else if meta.path.is_ident("id") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.id = Some(value.value());
            } else {
                return Err(meta.error("unsupported entity attribute, expected `kind` or `id`"));
            }
            Ok(())
        })?;
    }
    Ok(attrs)
}

fn find_id_field(input: &DeriveInput, named: Option<String>) -> syn::Result<Ident> {
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    &input.ident,
                    "Entity derive only supports structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "Entity derive only supports structs",
            ))
        }
    };

    if let Some(named) = named {
        let ident = format_ident!("{}", named);
        return fields
            .iter()
            .filter_map(|field| field.ident.as_ref())
            .find(|field| **field == ident)
            .cloned()
            .ok_or_else(|| {
                syn::Error::new_spanned(&input.ident, format!("no field named `{named}`"))
            });
    }

    for field in fields {
        for attr in &field.attrs {
            if !attr.path().is_ident("entity") {
                continue;
            }
            let mut is_id = false;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("id") {
                    is_id = true;
                    Ok(())
                } else {
                    Err(meta.error("unsupported field attribute, expected `id`"))
                }
            })?;
            if is_id {
                if let Some(ident) = &field.ident {
                    return Ok(ident.clone());
                }
            }
        }
    }

    fields
        .iter()
        .filter_map(|field| field.ident.as_ref())
        .find(|ident| *ident == "id")
        .cloned()
        .ok_or_else(|| {
            syn::Error::new_spanned(
                &input.ident,
                "Entity derive: no field marked with #[entity(id)] and no field named `id`",
            )
        })
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(ch.to_lowercase());
        } else {
            result.push(ch);
        }
    }
    result
}
