use crate::derive_utils::apply_derives;
use crate::field_utils::ensure_leading_fields;
use proc_macro::TokenStream;
use quote::{ToTokens, quote};
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Item, Result, Token, Type, parse::Parse, parse::ParseStream, parse_macro_input};

/// #[integration_event] 宏实现
/// - 仅支持具名字段、无泛型的结构体
/// - 确保字段 `id: Uuid`、`occurred_at: DateTime<Utc>` 存在并位于最前
/// - 合并派生：Debug, Clone, Serialize, Deserialize
/// - 生成 `::rebus_core::event::IntegrationEvent` 实现；事件类型名默认取结构体名，
///   可用 `#[integration_event(name = "...")]` 覆写
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as IntegrationEventAttr);
    let mut input = parse_macro_input!(item as Item);

    let st = match &mut input {
        Item::Struct(s) => s,
        other => {
            return syn::Error::new(other.span(), "#[integration_event] only on struct")
                .to_compile_error()
                .into();
        }
    };

    if !st.generics.params.is_empty() {
        return syn::Error::new(
            st.generics.span(),
            "#[integration_event] does not support generic structs",
        )
        .to_compile_error()
        .into();
    }

    let vis = st.vis.clone();
    let fields_named = match &mut st.fields {
        syn::Fields::Named(f) => f,
        _ => {
            return syn::Error::new(st.span(), "#[integration_event] requires named fields")
                .to_compile_error()
                .into();
        }
    };

    let id_ty: Type = syn::parse_quote! { ::uuid::Uuid };
    let occurred_at_ty: Type = syn::parse_quote! { ::chrono::DateTime<::chrono::Utc> };
    ensure_leading_fields(
        fields_named,
        &vis,
        &[("id", &id_ty), ("occurred_at", &occurred_at_ty)],
    );

    apply_derives(
        &mut st.attrs,
        vec![
            syn::parse_quote!(Debug),
            syn::parse_quote!(Clone),
            syn::parse_quote!(::serde::Serialize),
            syn::parse_quote!(::serde::Deserialize),
        ],
    );

    let ident = &st.ident;
    let event_type = cfg
        .name
        .unwrap_or_else(|| syn::LitStr::new(&ident.to_string(), ident.span()));

    let expanded = quote! {
        #st

        impl ::rebus_core::event::IntegrationEvent for #ident {
            const EVENT_TYPE: &'static str = #event_type;

            fn event_id(&self) -> ::uuid::Uuid {
                self.id
            }

            fn occurred_at(&self) -> ::chrono::DateTime<::chrono::Utc> {
                self.occurred_at
            }
        }
    };

    TokenStream::from(expanded)
}

// 结构体级配置：事件类型名
struct IntegrationEventAttr {
    name: Option<syn::LitStr>,
}

impl Parse for IntegrationEventAttr {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut name: Option<syn::LitStr> = None;

        if input.is_empty() {
            return Ok(Self { name });
        }

        let pairs = Punctuated::<syn::ExprAssign, Token![,]>::parse_terminated(input)?;
        for assign in pairs.into_iter() {
            let key_ident = match *assign.left {
                syn::Expr::Path(p) if p.path.segments.len() == 1 => {
                    p.path.segments[0].ident.clone()
                }
                other => return Err(syn::Error::new(other.span(), "invalid attribute key")),
            };
            match key_ident.to_string().as_str() {
                "name" => {
                    if name.is_some() {
                        return Err(syn::Error::new(
                            key_ident.span(),
                            "duplicate key 'name' in attribute",
                        ));
                    }
                    let lit: syn::LitStr = syn::parse2(assign.right.to_token_stream())?;
                    if lit.value().trim().is_empty() {
                        return Err(syn::Error::new(lit.span(), "event type name must not be empty"));
                    }
                    name = Some(lit);
                }
                _ => {
                    return Err(syn::Error::new(
                        key_ident.span(),
                        "unknown key; expected 'name'",
                    ));
                }
            }
        }

        Ok(Self { name })
    }
}
