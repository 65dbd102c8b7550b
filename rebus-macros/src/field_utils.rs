use proc_macro2::Span;
use syn::{Field, FieldsNamed, Ident, Token, Type, Visibility, punctuated::Punctuated};

fn is_named(field: &Field, name: &str) -> bool {
    field.ident.as_ref().is_some_and(|i| i == name)
}

/// 确保具名字段结构体包含所需字段，并按给定顺序置于最前
/// - 已存在的字段复用原定义（保留类型与属性）；
/// - 缺失的字段以结构体的可见性新增；
/// - 其余字段保持原有相对顺序。
pub(crate) fn ensure_leading_fields(
    fields_named: &mut FieldsNamed,
    vis: &Visibility,
    required: &[(&str, &Type)],
) {
    let old_named = fields_named.named.clone();
    let mut new_named: Punctuated<Field, Token![,]> = Punctuated::new();

    for (name, ty) in required.iter() {
        match old_named.iter().find(|f| is_named(f, name)) {
            Some(existing) => new_named.push(existing.clone()),
            None => {
                let ident = Ident::new(name, Span::call_site());
                new_named.push(syn::parse_quote! { #vis #ident: #ty });
            }
        }
    }

    for f in old_named.into_iter() {
        if !required.iter().any(|(name, _)| is_named(&f, name)) {
            new_named.push(f);
        }
    }

    fields_named.named = new_named;
}
