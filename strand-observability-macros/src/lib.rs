//! `#[obs]` attaches a `tracing` span to a function when the calling crate is
//! built with the `observability` feature, and is a no-op otherwise.
//!
//! Arguments are forwarded to `tracing::instrument` after `skip_all`, so
//! `#[obs(fields(strand_id = %id))]` records only the listed fields.

use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

#[proc_macro_attribute]
pub fn obs(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item = parse_macro_input!(input as ItemFn);
    let args = proc_macro2::TokenStream::from(args);
    let attr = if args.is_empty() {
        syn::parse_quote!(
            #[cfg_attr(feature = "observability", tracing::instrument(skip_all, level = "debug"))]
        )
    } else {
        syn::parse_quote!(
            #[cfg_attr(
                feature = "observability",
                tracing::instrument(skip_all, level = "debug", #args)
            )]
        )
    };
    item.attrs.push(attr);
    TokenStream::from(quote!(#item))
}
