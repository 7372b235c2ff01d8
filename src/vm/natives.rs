use std::borrow::Cow;
use std::io::BufRead;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::Rng;

use crate::table::Table;
use crate::value::{Heap, NativeFn, ObjNative, Value};

/// What a native callable gets to touch: the calling VM's heap (for
/// allocating return values) plus the clock and generator owned by that VM.
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub started_at: Instant,
    pub rng: &'a mut SmallRng,
}

type NativeResult = Result<Value, Cow<'static, str>>;

/// Binds the built-in callables into a globals table. Runs once per VM, and
/// again for every sibling VM since siblings get fresh globals.
pub(crate) fn register(globals: &mut Table, heap: &mut Heap) {
    let mut define = |name: &str, function: NativeFn| {
        let name = heap.intern(name);
        let value = heap.gc.new_value(ObjNative { function });
        globals.set(name, value);
    };

    define("clock", clock);
    define("rand", rand);
    define("len", len);
    define("append", append);
    define("delete", delete);
    define("int_input", int_input);
    define("str_input", str_input);
    define("char_input", char_input);
}

fn expect_arity(name: &str, args: &[Value], arity: usize) -> Result<(), Cow<'static, str>> {
    if args.len() == arity {
        Ok(())
    } else {
        Err(format!(
            "{}() takes {} argument(s), got {}",
            name,
            arity,
            args.len()
        )
        .into())
    }
}

/// Seconds since the VM started.
fn clock(ctx: &mut NativeCtx<'_>, args: &[Value]) -> NativeResult {
    expect_arity("clock", args, 0)?;
    Ok(Value::new_number(ctx.started_at.elapsed().as_secs_f64()))
}

/// Uniform pseudo-random non-negative number.
fn rand(ctx: &mut NativeCtx<'_>, args: &[Value]) -> NativeResult {
    expect_arity("rand", args, 0)?;
    Ok(Value::new_number(ctx.rng.gen::<u32>() as f64))
}

fn len(_ctx: &mut NativeCtx<'_>, args: &[Value]) -> NativeResult {
    expect_arity("len", args, 1)?;

    if let Some(list) = args[0].try_as_list() {
        return Ok(Value::new_number(list.borrow().items.len() as f64));
    }
    if let Some(s) = args[0].try_as_string() {
        return Ok(Value::new_number(s.chars().count() as f64));
    }

    Err(format!("len() takes a list or a string, got a {}", args[0].type_name()).into())
}

/// Appends in place and returns the list, so calls chain.
fn append(_ctx: &mut NativeCtx<'_>, args: &[Value]) -> NativeResult {
    expect_arity("append", args, 2)?;

    let Some(list) = args[0].try_as_list() else {
        return Err(format!("append() takes a list, got a {}", args[0].type_name()).into());
    };

    list.borrow_mut().items.push(args[1]);
    Ok(args[0])
}

/// Removes the element at the given index and returns it.
fn delete(_ctx: &mut NativeCtx<'_>, args: &[Value]) -> NativeResult {
    expect_arity("delete", args, 2)?;

    let Some(list) = args[0].try_as_list() else {
        return Err(format!("delete() takes a list, got a {}", args[0].type_name()).into());
    };
    let Some(index) = args[1].try_as_number() else {
        return Err(format!("delete() index must be a number, got a {}", args[1].type_name()).into());
    };

    let mut list = list.borrow_mut();
    if index.fract() != 0.0 || index < 0.0 || index >= list.items.len() as f64 {
        return Err(format!(
            "delete() index {} out of bounds for length {}",
            index,
            list.items.len()
        )
        .into());
    }

    Ok(list.items.remove(index as usize))
}

fn read_line() -> Result<String, Cow<'static, str>> {
    let mut line = String::new();
    let read = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| Cow::from(format!("failed to read input: {}", err)))?;
    if read == 0 {
        return Err("unexpected end of input".into());
    }

    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

fn int_input(_ctx: &mut NativeCtx<'_>, args: &[Value]) -> NativeResult {
    expect_arity("int_input", args, 0)?;

    let line = read_line()?;
    match line.trim().parse::<i64>() {
        Ok(n) => Ok(Value::new_number(n as f64)),
        Err(_) => Err(format!("int_input() expected an integer, got `{}`", line.trim()).into()),
    }
}

fn str_input(ctx: &mut NativeCtx<'_>, args: &[Value]) -> NativeResult {
    expect_arity("str_input", args, 0)?;

    let line = read_line()?;
    Ok(Value::new_string(ctx.heap.intern(line)))
}

fn char_input(ctx: &mut NativeCtx<'_>, args: &[Value]) -> NativeResult {
    expect_arity("char_input", args, 0)?;

    let line = read_line()?;
    match line.chars().next() {
        Some(c) => Ok(Value::new_string(ctx.heap.intern(String::from(c)))),
        None => Err("char_input() got an empty line".into()),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use rand::SeedableRng;

    use super::*;
    use crate::value::ObjList;

    fn ctx<'a>(heap: &'a mut Heap, rng: &'a mut SmallRng) -> NativeCtx<'a> {
        // lifetimes force constructing in place; tests only need one at a time
        NativeCtx {
            heap,
            started_at: Instant::now(),
            rng,
        }
    }

    #[test]
    fn arity_is_checked() {
        let mut heap = Heap::new();
        let mut rng = SmallRng::seed_from_u64(0);
        let mut ctx = ctx(&mut heap, &mut rng);

        assert!(clock(&mut ctx, &[Value::NIL]).is_err());
        assert!(len(&mut ctx, &[]).is_err());
        assert!(append(&mut ctx, &[Value::NIL]).is_err());
    }

    #[test]
    fn len_of_lists_and_strings() {
        let mut heap = Heap::new();
        let mut rng = SmallRng::seed_from_u64(0);

        let list = heap.gc.new_value(RefCell::new(ObjList {
            items: vec![Value::NIL, Value::TRUE],
        }));
        let s = Value::new_string(heap.intern("abc"));

        let mut ctx = ctx(&mut heap, &mut rng);
        assert_eq!(len(&mut ctx, &[list]).unwrap(), Value::new_number(2.0));
        assert_eq!(len(&mut ctx, &[s]).unwrap(), Value::new_number(3.0));
        assert!(len(&mut ctx, &[Value::new_number(3.0)]).is_err());
    }

    #[test]
    fn append_and_delete_mutate_in_place() {
        let mut heap = Heap::new();
        let mut rng = SmallRng::seed_from_u64(0);

        let list = heap.gc.new_value(RefCell::new(ObjList::default()));

        let mut ctx = ctx(&mut heap, &mut rng);
        let returned = append(&mut ctx, &[list, Value::new_number(7.0)]).unwrap();
        assert_eq!(returned, list);
        assert_eq!(list.try_as_list().unwrap().borrow().items.len(), 1);

        let removed = delete(&mut ctx, &[list, Value::new_number(0.0)]).unwrap();
        assert_eq!(removed, Value::new_number(7.0));
        assert!(list.try_as_list().unwrap().borrow().items.is_empty());

        assert!(delete(&mut ctx, &[list, Value::new_number(0.0)]).is_err());
        assert!(delete(&mut ctx, &[list, Value::new_number(-1.0)]).is_err());
    }

    #[test]
    fn rand_is_non_negative() {
        let mut heap = Heap::new();
        let mut rng = SmallRng::seed_from_u64(42);
        let mut ctx = ctx(&mut heap, &mut rng);

        for _ in 0..100 {
            let n = rand(&mut ctx, &[]).unwrap().try_as_number().unwrap();
            assert!(n >= 0.0);
        }
    }
}
