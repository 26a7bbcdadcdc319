use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{quote, quote_spanned};
use syn::{AttributeArgs, ItemFn, Lit, Meta, NestedMeta, parse_macro_input, spanned::Spanned};

/// Runs the test body on the main thread of a freshly booted kernel.
///
/// The annotated function takes the kernel handle:
///
/// ```ignore
/// #[grading::kernel_test(seed = 3, timer = 200, debug = "t")]
/// fn smoke(kernel: &kthreads::Kernel) { /* ... */ }
/// ```
///
/// Every argument is optional. `seed` jitters the timer, `timer` sets its
/// period and `debug` enables debug categories. Other attributes such as
/// `#[should_panic]` apply to the generated test.
#[proc_macro_attribute]
pub fn kernel_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as AttributeArgs);
    let input_fn = parse_macro_input!(item as ItemFn);

    let mut config: TokenStream2 = quote! { ::kthreads::KernelConfig::default() };
    for arg in args {
        let setter = match &arg {
            NestedMeta::Meta(Meta::NameValue(nv)) => match (&nv.lit, nv.path.get_ident()) {
                (Lit::Int(lit), Some(ident)) if ident == "seed" => quote! { .random_seed(#lit) },
                (Lit::Int(lit), Some(ident)) if ident == "timer" => quote! { .timer_period(#lit) },
                (Lit::Str(lit), Some(ident)) if ident == "debug" => quote! { .debug(#lit) },
                _ => unknown(&arg),
            },
            _ => unknown(&arg),
        };
        config = quote! { #config #setter };
    }

    let attrs = &input_fn.attrs;
    let vis = &input_fn.vis;
    let name = &input_fn.sig.ident;
    let mut body = input_fn.clone();
    body.attrs.clear();
    body.vis = syn::Visibility::Inherited;

    TokenStream::from(quote_spanned! { input_fn.span() =>
        #[test]
        #(#attrs)*
        #vis fn #name() {
            #body
            ::kthreads::Kernel::boot(#config, #name)
        }
    })
}

fn unknown(arg: &NestedMeta) -> TokenStream2 {
    syn::Error::new(
        arg.span(),
        "expected `seed = <int>`, `timer = <int>` or `debug = \"<letters>\"`",
    )
    .to_compile_error()
}
