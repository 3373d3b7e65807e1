// These lints are triggered by darling's generated code for
// `#[darling(default)]`.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::needless_continue)]

use darling::{FromDeriveInput, FromMeta, util::PathList};
use heck::ToKebabCase;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, quote};
use syn::{DeriveInput, Ident, Path, parse_macro_input};

/// Parse `key = Type` meta items into a `syn::Type`.
fn parse_name_value_type(item: &syn::Meta) -> darling::Result<syn::Type> {
    let error = || darling::Error::unsupported_shape("expected `key = Type`");
    let syn::Meta::NameValue(nv) = item else {
        return Err(error());
    };
    syn::parse2(nv.value.to_token_stream()).map_err(|_| error())
}

/// Returns the name override or the default kebab-case name from the ident.
fn default_name(ident: &Ident, name: Option<String>) -> String {
    name.unwrap_or_else(|| ident.to_string().to_kebab_case())
}

/// Wrapper for `syn::Path` that parses from `key = Type` syntax.
#[derive(Debug, Clone)]
struct TypePath(Path);

impl FromMeta for TypePath {
    fn from_meta(item: &syn::Meta) -> darling::Result<Self> {
        let ty = parse_name_value_type(item)?;
        match ty {
            syn::Type::Path(type_path) if type_path.qself.is_none() => Ok(Self(type_path.path)),
            _ => Err(darling::Error::unsupported_shape("expected `key = Type`")),
        }
    }
}

/// Configuration for the `#[aggregate(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(aggregate), supports(struct_any))]
struct AggregateArgs {
    ident: Ident,
    generics: syn::Generics,
    id: TypePath,
    events: PathList,
    #[darling(default)]
    kind: Option<String>,
}

/// Configuration for the `#[versioned(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(versioned), supports(struct_any, enum_any))]
struct VersionedArgs {
    ident: Ident,
    #[darling(default)]
    name: Option<String>,
    #[darling(default)]
    version: u32,
    /// The next shape in the upgrade chain, built with `From<&Self>`.
    #[darling(default)]
    upgrade: Option<TypePath>,
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<T, F>(input: &DeriveInput, f: F) -> TokenStream2
where
    T: FromDeriveInput,
    F: FnOnce(T) -> TokenStream2,
{
    match T::from_derive_input(input) {
        Ok(args) => f(args),
        Err(err) => err.write_errors(),
    }
}

/// Derives the `AggregateState` trait for a struct.
///
/// This macro generates:
/// - `AggregateState::KIND` and `AggregateState::Id`
/// - `register_handlers`, declaring one `Apply<E>` handler per listed event
/// - `dispatch_table`, backed by a `static OnceLock` so the table is built on
///   first use
///
/// Each listed event type must implement `Versioned`, and the struct must
/// implement `Default` and `Apply<E>` for every event.
///
/// # Attributes
///
/// ## Required
/// - `id = Type` - Aggregate ID type
/// - `events(Type1, Type2, ...)` - Event types the state handles
///
/// ## Optional
/// - `kind = "name"` - Aggregate type identifier (default: kebab-case struct
///   name)
///
/// # Example
///
/// ```ignore
/// #[derive(Default, AggregateState)]
/// #[aggregate(id = String, events(FundsDeposited, FundsWithdrawn))]
/// pub struct Account {
///     balance: i64,
/// }
/// ```
#[proc_macro_derive(AggregateState, attributes(aggregate))]
pub fn derive_aggregate_state(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_aggregate_state_impl(&input).into()
}

/// Internal entry point that returns tokens for the aggregate state derive.
fn derive_aggregate_state_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<AggregateArgs, _>(input, generate_aggregate_state_impl)
}

/// Generate the aggregate state derive implementation tokens.
fn generate_aggregate_state_impl(args: AggregateArgs) -> TokenStream2 {
    let struct_name = &args.ident;

    if args.events.is_empty() {
        return darling::Error::custom("events(...) must contain at least one event type")
            .with_span(struct_name)
            .write_errors();
    }
    if !args.generics.params.is_empty() {
        return darling::Error::custom(
            "AggregateState cannot be derived for generic types; implement it by hand",
        )
        .with_span(&args.generics)
        .write_errors();
    }

    let kind = default_name(struct_name, args.kind);
    let id_type = &args.id.0;
    let event_types: Vec<&Path> = args.events.iter().collect();

    quote! {
        impl ::vellum::AggregateState for #struct_name {
            const KIND: &'static str = #kind;
            type Id = #id_type;

            fn register_handlers(handlers: &mut ::vellum::dispatch::DispatchTableBuilder<Self>) {
                #(handlers.on::<#event_types>();)*
            }

            fn dispatch_table() -> &'static ::vellum::dispatch::DispatchTable<Self> {
                static TABLE: ::std::sync::OnceLock<::vellum::dispatch::DispatchTable<#struct_name>> =
                    ::std::sync::OnceLock::new();
                TABLE.get_or_init(::vellum::dispatch::DispatchTable::build)
            }
        }
    }
}

/// Derives the `Versioned` trait for a struct or enum.
///
/// # Attributes
///
/// ## Optional
/// - `name = "name"` - Logical type name shared by every version (default:
///   kebab-case type name)
/// - `version = N` - Version of this shape (default: `0`, unversioned)
/// - `upgrade = Type` - Next shape in the chain; requires
///   `impl From<&Self> for Type`
///
/// # Example
///
/// ```ignore
/// #[derive(Versioned)]
/// #[versioned(name = "order-placed", version = 1, upgrade = OrderPlaced)]
/// pub struct OrderPlacedV1 {
///     total: u32,
/// }
///
/// #[derive(Versioned)]
/// #[versioned(name = "order-placed", version = 2)]
/// pub struct OrderPlaced {
///     total: u64,
///     currency: String,
/// }
/// ```
#[proc_macro_derive(Versioned, attributes(versioned))]
pub fn derive_versioned(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_versioned_impl(&input).into()
}

/// Internal entry point that returns tokens for the versioned derive.
fn derive_versioned_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<VersionedArgs, _>(input, |args| generate_versioned_impl(args, input))
}

/// Generate the versioned derive implementation tokens.
fn generate_versioned_impl(args: VersionedArgs, input: &DeriveInput) -> TokenStream2 {
    let type_name = &args.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let name = default_name(type_name, args.name);
    let version = args.version;

    if args.upgrade.is_some() && version == 0 {
        return darling::Error::custom("`upgrade` requires an explicit `version`")
            .with_span(type_name)
            .write_errors();
    }

    let upgrade_fn = args.upgrade.map(|TypePath(next)| {
        quote! {
            fn upgrade(&self) -> ::core::option::Option<::std::boxed::Box<dyn ::vellum::versioned::VersionedValue>> {
                let next: #next = ::core::convert::From::from(self);
                ::core::option::Option::Some(::std::boxed::Box::new(next))
            }
        }
    });

    quote! {
        impl #impl_generics ::vellum::Versioned for #type_name #ty_generics #where_clause {
            const NAME: &'static str = #name;
            const VERSION: u32 = #version;

            #upgrade_fn
        }
    }
}
