use proc_macro::TokenStream;
use quote::quote;
use syn::{spanned::Spanned, Lit};

/// Repeats the body of a test function `N` times.
///
/// Useful for tests whose inputs are randomly generated, or that exercise interleavings of
/// concurrent tasks.
///
/// ```ignore
/// #[n_times(100)]
/// #[test]
/// fn split_never_drops_entries() { /* ... */ }
/// ```
#[proc_macro_attribute]
pub fn n_times(args: TokenStream, item: TokenStream) -> TokenStream {
    let fun = syn::parse_macro_input!(item as syn::ItemFn);
    let n = syn::parse_macro_input!(args as Lit);

    let n: usize = match &n {
        Lit::Int(int) => match int.base10_parse() {
            Ok(n) => n,
            Err(e) => return e.to_compile_error().into(),
        },
        other => {
            return syn::Error::new(other.span(), "the repetition count must be an integer")
                .to_compile_error()
                .into()
        }
    };

    let syn::ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = fun;

    let repeated = quote! {
        #(#attrs)*
        #vis #sig {
            for _iteration in 0..#n {
                #block
            }
        }
    };

    repeated.into()
}
