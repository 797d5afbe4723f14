use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    Data, DeriveInput, Fields, Ident, LitStr, Type, parse_macro_input, spanned::Spanned,
};

/// Implements `stashdb::Entity` for a struct with named fields.
///
/// Struct options: `#[entity(table = "...")]` (defaults to the snake_case
/// struct name).
///
/// Field options:
/// - `#[entity(id)]` marks the `Option<EntityId>` id field; a field named
///   `id` is used when no field is marked
/// - `#[entity(reference)]` on an `Option<Child>` field stores the child as its
///   own row, linked from this one
/// - `#[entity(skip)]` leaves the field out of storage; it loads as `Default`
/// - `#[entity(column = "...")]` renames the column
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_entity(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_entity(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Entity does not support generic structs",
        ));
    }

    let options = parse_entity_options(&input.attrs)?;
    let table = options
        .table_name
        .unwrap_or_else(|| to_snake_case(&struct_name.to_string()));

    let data_struct = match input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity can only be derived for structs",
            ));
        }
    };

    let named_fields = match data_struct.fields {
        Fields::Named(fields) => fields,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity requires named fields",
            ));
        }
    };

    let mut id_field: Option<Ident> = None;
    let mut fallback_id: Option<Ident> = None;
    let mut fields = Vec::<EntityField>::new();

    for field in named_fields.named {
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new(field.span(), "Entity requires named fields"))?;
        let field_options = parse_field_options(&field.attrs)?;

        if field_options.id {
            if id_field.is_some() {
                return Err(syn::Error::new(
                    field.span(),
                    "only one field can be marked #[entity(id)]",
                ));
            }
            ensure_option(&field.ty, "#[entity(id)] field must be Option<EntityId>")?;
            id_field = Some(ident);
            continue;
        }

        if ident == "id" && !field_options.reference && !field_options.skip {
            fallback_id = Some(ident.clone());
        }

        let column_name = field_options
            .column_name
            .clone()
            .unwrap_or_else(|| ident.to_string().trim_start_matches("r#").to_string());

        let kind = if field_options.skip {
            FieldKind::Skip
        } else if field_options.reference {
            let child = ensure_option(
                &field.ty,
                "#[entity(reference)] field must be Option<ChildEntity>",
            )?;
            FieldKind::Reference(child)
        } else {
            FieldKind::Column
        };

        fields.push(EntityField {
            ident,
            ty: field.ty,
            column_name,
            kind,
        });
    }

    let id_field = match (id_field, fallback_id) {
        (Some(id), _) => id,
        (None, Some(id)) => {
            if let Some(field) = fields.iter().find(|field| field.ident == id) {
                ensure_option(&field.ty, "`id` field must be Option<EntityId>")?;
            }
            fields.retain(|field| field.ident != id);
            id
        }
        (None, None) => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity needs an Option<EntityId> field named `id` or marked #[entity(id)]",
            ));
        }
    };

    let descriptors = fields.iter().filter_map(|field| {
        let name = &field.column_name;
        let ty = &field.ty;
        match &field.kind {
            FieldKind::Column => Some(quote! {
                ::stashdb::FieldDescriptor::column(
                    #name,
                    <#ty as ::stashdb::ColumnValue>::DATA_TYPE,
                    <#ty as ::stashdb::ColumnValue>::NULLABLE,
                )
            }),
            FieldKind::Reference(child) => Some(quote! {
                ::stashdb::FieldDescriptor::reference(
                    #name,
                    <#child as ::stashdb::Entity>::TABLE,
                )
            }),
            FieldKind::Skip => None,
        }
    });

    let record_inserts = fields
        .iter()
        .filter(|field| matches!(field.kind, FieldKind::Column))
        .map(|field| {
            let ident = &field.ident;
            let name = &field.column_name;
            quote! {
                record.insert(
                    #name.to_string(),
                    ::stashdb::ColumnValue::to_value(&self.#ident),
                );
            }
        });

    let loads = fields.iter().map(|field| {
        let ident = &field.ident;
        let name = &field.column_name;
        let ty = &field.ty;
        match &field.kind {
            FieldKind::Column => quote!(#ident: loader.column::<#ty>(#name)?),
            FieldKind::Reference(child) => quote!(#ident: loader.reference::<#child>(#name)?),
            FieldKind::Skip => quote!(#ident: ::core::default::Default::default()),
        }
    });

    let references = fields
        .iter()
        .filter(|field| matches!(field.kind, FieldKind::Reference(_)))
        .collect::<Vec<_>>();

    let reference_methods = if references.is_empty() {
        quote!()
    } else {
        let visits = references.iter().map(|field| {
            let ident = &field.ident;
            let name = &field.column_name;
            quote! {
                visitor(
                    #name,
                    self.#ident.as_ref().map(|child| child as &dyn ::stashdb::AnyEntity),
                );
            }
        });
        let visits_mut = references.iter().map(|field| {
            let ident = &field.ident;
            let name = &field.column_name;
            quote! {
                if let Some(child) = self.#ident.as_mut() {
                    visitor(#name, child)?;
                }
            }
        });
        let clears = references.iter().map(|field| {
            let ident = &field.ident;
            let name = &field.column_name;
            quote! {
                #name => {
                    self.#ident = None;
                    true
                }
            }
        });

        quote! {
            fn visit_references(
                &self,
                visitor: &mut dyn FnMut(&'static str, Option<&dyn ::stashdb::AnyEntity>),
            ) {
                #(#visits)*
            }

            fn visit_references_mut(
                &mut self,
                visitor: &mut dyn FnMut(&'static str, &mut dyn ::stashdb::AnyEntity) -> ::stashdb::Result<()>,
            ) -> ::stashdb::Result<()> {
                #(#visits_mut)*
                Ok(())
            }

            fn clear_reference(&mut self, field: &str) -> bool {
                match field {
                    #(#clears)*
                    _ => false,
                }
            }
        }
    };

    Ok(quote! {
        impl ::stashdb::Entity for #struct_name {
            const TABLE: &'static str = #table;

            fn fields() -> Vec<::stashdb::FieldDescriptor> {
                vec![#(#descriptors),*]
            }

            fn id(&self) -> Option<::stashdb::EntityId> {
                self.#id_field
            }

            fn set_id(&mut self, id: ::stashdb::EntityId) {
                self.#id_field = Some(id);
            }

            fn to_record(&self) -> ::stashdb::Record {
                let mut record = ::stashdb::Record::new();
                #(#record_inserts)*
                record
            }

            fn from_record(loader: &::stashdb::Loader<'_>) -> ::stashdb::Result<Self> {
                Ok(Self {
                    #id_field: Some(loader.id()),
                    #(#loads,)*
                })
            }

            #reference_methods
        }
    })
}

struct EntityOptions {
    table_name: Option<String>,
}

#[derive(Default)]
struct FieldOptions {
    id: bool,
    reference: bool,
    skip: bool,
    column_name: Option<String>,
}

enum FieldKind {
    Column,
    /// Holds the child entity type.
    Reference(Type),
    Skip,
}

struct EntityField {
    ident: Ident,
    ty: Type,
    column_name: String,
    kind: FieldKind,
}

fn parse_entity_options(attrs: &[syn::Attribute]) -> syn::Result<EntityOptions> {
    let mut options = EntityOptions { table_name: None };

    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                if lit.value().trim().is_empty() {
                    return Err(meta.error("table name cannot be empty"));
                }
                options.table_name = Some(lit.value());
                return Ok(());
            }

            Err(meta.error("Unsupported #[entity(...)] option on a struct. Supported: table = \"...\""))
        })?;
    }

    Ok(options)
}

fn parse_field_options(attrs: &[syn::Attribute]) -> syn::Result<FieldOptions> {
    let mut parsed = FieldOptions::default();

    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("id") {
                parsed.id = true;
                return Ok(());
            }

            if meta.path.is_ident("reference") {
                parsed.reference = true;
                return Ok(());
            }

            if meta.path.is_ident("skip") {
                parsed.skip = true;
                return Ok(());
            }

            if meta.path.is_ident("column") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                parsed.column_name = Some(lit.value());
                return Ok(());
            }

            Err(meta.error(
                "Unsupported #[entity(...)] option on a field. Supported: id, reference, skip, column = \"...\"",
            ))
        })?;

        let flags = [parsed.id, parsed.reference, parsed.skip]
            .iter()
            .filter(|flag| **flag)
            .count();
        if flags > 1 {
            return Err(syn::Error::new(
                attr.span(),
                "#[entity(id)], #[entity(reference)] and #[entity(skip)] are mutually exclusive",
            ));
        }
        if (parsed.id || parsed.skip) && parsed.column_name.is_some() {
            return Err(syn::Error::new(
                attr.span(),
                "only stored fields can define a custom column name",
            ));
        }
    }

    Ok(parsed)
}

/// Returns `T` for an `Option<T>` type.
fn ensure_option(ty: &Type, message: &str) -> syn::Result<Type> {
    let Type::Path(type_path) = ty else {
        return Err(syn::Error::new(ty.span(), message));
    };
    let Some(segment) = type_path.path.segments.last() else {
        return Err(syn::Error::new(ty.span(), message));
    };
    if segment.ident != "Option" {
        return Err(syn::Error::new(ty.span(), message));
    }
    first_generic_type(segment).ok_or_else(|| syn::Error::new(ty.span(), message))
}

fn first_generic_type(segment: &syn::PathSegment) -> Option<Type> {
    let syn::PathArguments::AngleBracketed(arguments) = &segment.arguments else {
        return None;
    };

    for arg in &arguments.args {
        if let syn::GenericArgument::Type(ty) = arg {
            return Some(ty.clone());
        }
    }
    None
}

fn to_snake_case(value: &str) -> String {
    let mut out = String::new();
    for (index, ch) in value.chars().enumerate() {
        if ch.is_uppercase() {
            if index > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
